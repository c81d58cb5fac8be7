mod common;

use common::{quotas, Fixture};
use k1s0_quota_engine::{
    LimitLookup, QuotaContext, QuotaError, QuotaQuery, QuotaStore, SettableQuota, UNLIMITED,
};

async fn seed_hierarchy(fx: &Fixture) {
    fx.store.set_class_quota("gold", "instances", 20).await.unwrap();
    fx.store.set_project_quota("p1", "instances", 15).await.unwrap();
    fx.store.set_user_quota("p1", "u1", "instances", 5).await.unwrap();
}

#[tokio::test]
async fn test_most_specific_limit_wins() {
    let fx = Fixture::new();
    seed_hierarchy(&fx).await;

    let cases = [
        (QuotaContext::new("p1", "u1").with_quota_class("gold"), 5),
        (QuotaContext::new("p1", "u2").with_quota_class("gold"), 15),
        (QuotaContext::new("p2", "u1").with_quota_class("gold"), 20),
        (QuotaContext::new("p2", "u1"), 10),
    ];
    for (ctx, expected) in cases {
        let limit = fx
            .engine
            .quota(&ctx, "instances", &LimitLookup::default())
            .await
            .unwrap();
        assert_eq!(limit, expected, "context {ctx:?}");
    }
}

#[tokio::test]
async fn test_explicit_lookup_overrides_context() {
    let fx = Fixture::new();
    seed_hierarchy(&fx).await;
    let ctx = QuotaContext::new("p2", "u9");

    let lookup = LimitLookup {
        project_id: Some("p1".to_string()),
        user_id: Some("u1".to_string()),
        quota_class: None,
    };
    assert_eq!(fx.engine.quota(&ctx, "instances", &lookup).await.unwrap(), 5);

    let lookup = LimitLookup {
        quota_class: Some("gold".to_string()),
        ..LimitLookup::default()
    };
    assert_eq!(fx.engine.quota(&ctx, "instances", &lookup).await.unwrap(), 20);
}

#[tokio::test]
async fn test_unlimited_applies_only_at_its_level() {
    let fx = Fixture::new();
    fx.store.set_class_quota("gold", "cores", 8).await.unwrap();
    fx.store.set_project_quota("p4", "cores", UNLIMITED).await.unwrap();
    fx.store.set_user_quota("p4", "u1", "cores", 3).await.unwrap();

    assert_eq!(cores_limit(&fx, "u1").await, 3);
    assert_eq!(cores_limit(&fx, "u2").await, UNLIMITED);
}

async fn cores_limit(fx: &Fixture, user_id: &str) -> i64 {
    let ctx = QuotaContext::new("p4", user_id).with_quota_class("gold");
    fx.engine
        .quota(&ctx, "cores", &LimitLookup::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_point_lookups_report_missing_overrides() {
    let fx = Fixture::new();
    seed_hierarchy(&fx).await;
    let ctx = QuotaContext::new("p1", "u1");

    assert_eq!(fx.engine.get_by_project(&ctx, "p1", "instances").await.unwrap(), 15);
    let result = fx.engine.get_by_project(&ctx, "p1", "cores").await;
    assert!(matches!(result, Err(QuotaError::ProjectQuotaNotFound { ref project_id }) if project_id == "p1"));

    let result = fx.engine.get_by_project_and_user(&ctx, "p1", "u2", "instances").await;
    assert!(matches!(result, Err(QuotaError::ProjectUserQuotaNotFound { .. })));

    let result = fx.engine.get_by_class(&ctx, "silver", "instances").await;
    assert!(matches!(result, Err(QuotaError::QuotaClassNotFound { ref class_name }) if class_name == "silver"));
}

#[tokio::test]
async fn test_defaults_and_class_quotas() {
    let fx = Fixture::new();
    seed_hierarchy(&fx).await;
    fx.store.set_class_quota("default", "cores", 40).await.unwrap();
    let ctx = QuotaContext::new("p1", "u1");

    let defaults = fx.engine.get_defaults(&ctx).await.unwrap();
    assert_eq!(defaults.len(), 7);
    assert_eq!(defaults["cores"], 40);
    assert_eq!(defaults["instances"], 10);
    assert_eq!(defaults["fixed_ips"], UNLIMITED);

    let gold = fx.engine.get_class_quotas(&ctx, "gold", false).await.unwrap();
    assert_eq!(gold, quotas(&[("instances", 20)]));

    let gold = fx.engine.get_class_quotas(&ctx, "gold", true).await.unwrap();
    assert_eq!(gold.len(), 7);
    assert_eq!(gold["instances"], 20);
    assert_eq!(gold["cores"], 40);
}

#[tokio::test]
async fn test_project_quotas_merge_usage_and_counts() {
    let fx = Fixture::new();
    let ctx = QuotaContext::new("p1", "u1");
    let u2 = QuotaContext::new("p1", "u2");

    let committed = fx
        .engine
        .reserve(&u2, &quotas(&[("instances", 1)]), None, None, None)
        .await
        .unwrap();
    fx.engine.commit(&u2, &committed, None, None).await.unwrap();
    fx.engine
        .reserve(&ctx, &quotas(&[("instances", 2)]), None, None, None)
        .await
        .unwrap();

    let project = fx
        .engine
        .get_project_quotas(&ctx, "p1", &QuotaQuery::default())
        .await
        .unwrap();
    assert_eq!(project.len(), 7);
    assert_eq!(project["instances"].limit, 10);
    assert_eq!(project["instances"].in_use, Some(1));
    assert_eq!(project["instances"].reserved, Some(2));
    assert_eq!(project["fixed_ips"].in_use, Some(3));
    assert_eq!(project["key_pairs"].in_use, Some(4));
    assert_eq!(project["metadata_items"].in_use, Some(0));
    assert_eq!(project["instances"].remains, None);

    let user = fx
        .engine
        .get_user_quotas(&ctx, "p1", "u1", &QuotaQuery::default())
        .await
        .unwrap();
    assert_eq!(user["instances"].in_use, Some(0));
    assert_eq!(user["instances"].reserved, Some(2));
    assert_eq!(user["key_pairs"].in_use, Some(2));
    assert_eq!(fx.counter.calls(), 2);

    let limits = fx
        .engine
        .get_project_quotas(&ctx, "p1", &QuotaQuery::limits_only())
        .await
        .unwrap();
    assert!(limits.values().all(|d| d.in_use.is_none() && d.reserved.is_none()));
}

#[tokio::test]
async fn test_project_quotas_without_defaults() {
    let fx = Fixture::new();
    seed_hierarchy(&fx).await;
    let ctx = QuotaContext::new("p1", "u1");

    let query = QuotaQuery {
        defaults: false,
        ..QuotaQuery::limits_only()
    };
    let project = fx.engine.get_project_quotas(&ctx, "p1", &query).await.unwrap();
    assert_eq!(project.keys().collect::<Vec<_>>(), vec!["instances"]);
    assert_eq!(project["instances"].limit, 15);

    // 自プロジェクト以外ではコンテキストのクラスを使わない
    let gold = QuotaContext::new("p1", "u1").with_quota_class("gold");
    let other = fx
        .engine
        .get_project_quotas(&gold, "p2", &QuotaQuery::limits_only())
        .await
        .unwrap();
    assert_eq!(other["instances"].limit, 10);
    let gold = QuotaContext::new("p2", "u1").with_quota_class("gold");
    let own = fx
        .engine
        .get_project_quotas(&gold, "p2", &QuotaQuery::limits_only())
        .await
        .unwrap();
    assert_eq!(own["instances"].limit, 20);
}

#[tokio::test]
async fn test_remains_subtract_user_allocations() {
    let fx = Fixture::new();
    fx.store.set_user_quota("p1", "u1", "instances", 4).await.unwrap();
    fx.store.set_user_quota("p1", "u2", "instances", 3).await.unwrap();
    fx.store.set_user_quota("p1", "u3", "instances", UNLIMITED).await.unwrap();
    let ctx = QuotaContext::new("p1", "u1");

    let project = fx
        .engine
        .get_project_quotas(&ctx, "p1", &QuotaQuery::default().with_remains())
        .await
        .unwrap();
    assert_eq!(project["instances"].remains, Some(3));
    assert_eq!(project["cores"].remains, Some(20));
    assert_eq!(project["fixed_ips"].remains, Some(UNLIMITED));

    let user = fx
        .engine
        .get_user_quotas(&ctx, "p1", "u1", &QuotaQuery::default().with_remains())
        .await
        .unwrap();
    assert_eq!(user["instances"].limit, 4);
    assert_eq!(user["instances"].remains, Some(3));
}

#[tokio::test]
async fn test_settable_minimum_covers_consumption() {
    let fx = Fixture::new();
    fx.store.set_project_quota("p1", "instances", 10).await.unwrap();
    let u1 = QuotaContext::new("p1", "u1");
    let u2 = QuotaContext::new("p1", "u2");

    let first = fx
        .engine
        .reserve(&u1, &quotas(&[("instances", 4)]), None, None, None)
        .await
        .unwrap();
    fx.engine.commit(&u1, &first, None, None).await.unwrap();
    fx.engine
        .reserve(&u2, &quotas(&[("instances", 3)]), None, None, None)
        .await
        .unwrap();

    let settable = fx.engine.get_settable_quotas(&u1, "p1", None).await.unwrap();
    assert_eq!(
        settable["instances"],
        SettableQuota {
            minimum: 7,
            maximum: 10
        }
    );
    assert_eq!(
        settable["fixed_ips"],
        SettableQuota {
            minimum: 3,
            maximum: UNLIMITED
        }
    );

    fx.store.set_user_quota("p1", "u1", "instances", 5).await.unwrap();
    fx.store.set_user_quota("p1", "u2", "instances", 3).await.unwrap();

    let settable = fx.engine.get_settable_quotas(&u1, "p1", None).await.unwrap();
    assert_eq!(settable["instances"].minimum, 8);

    let settable = fx
        .engine
        .get_settable_quotas(&u1, "p1", Some("u1"))
        .await
        .unwrap();
    assert_eq!(
        settable["instances"],
        SettableQuota {
            minimum: 4,
            maximum: 7
        }
    );
}

#[tokio::test]
async fn test_limit_check_reports_overs() {
    let fx = Fixture::new();
    let ctx = QuotaContext::new("p1", "u1");

    fx.engine
        .limit_check(&ctx, &quotas(&[("key_pairs", 100), ("fixed_ips", 100_000)]), None, None)
        .await
        .unwrap();

    let result = fx
        .engine
        .limit_check(&ctx, &quotas(&[("key_pairs", 101), ("instances", 1)]), None, None)
        .await;
    match result.unwrap_err() {
        QuotaError::OverQuota(detail) => {
            assert_eq!(detail.code, 413);
            assert_eq!(detail.overs, vec!["key_pairs"]);
            assert_eq!(detail.quotas["key_pairs"], 100);
            assert_eq!(detail.headroom, quotas(&[("key_pairs", 100)]));
        }
        e => unreachable!("unexpected error: {e:?}"),
    }
}

#[tokio::test]
async fn test_limit_check_rejects_negative_values() {
    let fx = Fixture::new();
    let ctx = QuotaContext::new("p1", "u1");

    let result = fx
        .engine
        .limit_check(&ctx, &quotas(&[("key_pairs", -1), ("fixed_ips", 1)]), None, None)
        .await;
    match result.unwrap_err() {
        QuotaError::InvalidQuotaValue { unders } => assert_eq!(unders, vec!["key_pairs"]),
        e => unreachable!("unexpected error: {e:?}"),
    }
}

#[tokio::test]
async fn test_limit_check_zero_against_zero_limit() {
    let fx = Fixture::new();
    fx.store.set_project_quota("p1", "key_pairs", 0).await.unwrap();
    let ctx = QuotaContext::new("p1", "u1");

    fx.engine
        .limit_check(&ctx, &quotas(&[("key_pairs", 0)]), None, None)
        .await
        .unwrap();
    let result = fx
        .engine
        .limit_check(&ctx, &quotas(&[("key_pairs", 1)]), None, None)
        .await;
    assert!(matches!(result, Err(QuotaError::OverQuota(_))));
}

#[tokio::test]
async fn test_limit_check_project_and_user() {
    let fx = Fixture::new();
    fx.store.set_project_quota("p1", "key_pairs", 10).await.unwrap();
    fx.store.set_user_quota("p1", "u1", "key_pairs", 2).await.unwrap();
    let ctx = QuotaContext::new("p1", "u1");
    let engine = &fx.engine;

    let result = engine
        .limit_check_project_and_user(
            &ctx,
            Some(&quotas(&[("key_pairs", 5)])),
            Some(&quotas(&[("key_pairs", 3)])),
            None,
            None,
        )
        .await;
    match result.unwrap_err() {
        QuotaError::OverQuota(detail) => {
            assert_eq!(detail.overs, vec!["key_pairs"]);
            assert_eq!(detail.headroom["key_pairs"], 2);
        }
        e => unreachable!("unexpected error: {e:?}"),
    }

    // 片方だけ指定した値はもう片方にも適用される
    let result = engine
        .limit_check_project_and_user(&ctx, Some(&quotas(&[("key_pairs", 3)])), None, None, None)
        .await;
    assert!(matches!(result, Err(QuotaError::OverQuota(_))));
    engine
        .limit_check_project_and_user(&ctx, None, Some(&quotas(&[("key_pairs", 2)])), None, None)
        .await
        .unwrap();
    let result = engine
        .limit_check_project_and_user(&ctx, None, Some(&quotas(&[("key_pairs", 11)])), None, None)
        .await;
    assert!(matches!(result, Err(QuotaError::OverQuota(_))));
}

#[tokio::test]
async fn test_limit_check_project_and_user_edge_values() {
    let fx = Fixture::new();
    fx.store.set_user_quota("p1", "u1", "key_pairs", 0).await.unwrap();
    let ctx = QuotaContext::new("p1", "u1");
    let engine = &fx.engine;

    engine
        .limit_check_project_and_user(
            &ctx,
            Some(&quotas(&[("key_pairs", 0)])),
            Some(&quotas(&[("key_pairs", 0)])),
            None,
            None,
        )
        .await
        .unwrap();

    let result = engine
        .limit_check_project_and_user(&ctx, None, None, None, None)
        .await;
    assert!(matches!(result, Err(QuotaError::InvalidInput(_))));

    let empty = quotas(&[]);
    let result = engine
        .limit_check_project_and_user(&ctx, Some(&empty), Some(&empty), None, None)
        .await;
    assert!(matches!(result, Err(QuotaError::InvalidInput(_))));

    let result = engine
        .limit_check_project_and_user(
            &ctx,
            Some(&quotas(&[("key_pairs", 1)])),
            Some(&quotas(&[("fixed_ips", -1)])),
            None,
            None,
        )
        .await;
    assert!(matches!(
        result,
        Err(QuotaError::InvalidQuotaValue { ref unders }) if unders == &["fixed_ips"]
    ));
}
