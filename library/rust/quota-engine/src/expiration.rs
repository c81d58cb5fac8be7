use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::QuotaError;

/// Expiration は予約の有効期限指定を表す。
///
/// Offsets are relative to the moment the reservation is created and are
/// normalized to an absolute timestamp before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Seconds(i64),
    Duration(TimeDelta),
    At(DateTime<Utc>),
}

impl Expiration {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, QuotaError> {
        let offset = match *self {
            Expiration::At(at) => return Ok(at),
            Expiration::Seconds(secs) => {
                if secs < 0 {
                    return Err(self.invalid());
                }
                TimeDelta::try_seconds(secs).ok_or_else(|| self.invalid())?
            }
            Expiration::Duration(delta) => delta,
        };
        if offset < TimeDelta::zero() {
            return Err(self.invalid());
        }
        now.checked_add_signed(offset)
            .ok_or_else(|| self.invalid())
    }

    fn invalid(&self) -> QuotaError {
        let expire = match self {
            Expiration::Seconds(secs) => secs.to_string(),
            Expiration::Duration(delta) => delta.to_string(),
            Expiration::At(at) => at.to_rfc3339(),
        };
        QuotaError::InvalidReservationExpiration { expire }
    }
}

impl From<i64> for Expiration {
    fn from(secs: i64) -> Self {
        Expiration::Seconds(secs)
    }
}

impl From<TimeDelta> for Expiration {
    fn from(delta: TimeDelta) -> Self {
        Expiration::Duration(delta)
    }
}

impl From<DateTime<Utc>> for Expiration {
    fn from(at: DateTime<Utc>) -> Self {
        Expiration::At(at)
    }
}

impl TryFrom<std::time::Duration> for Expiration {
    type Error = QuotaError;

    fn try_from(duration: std::time::Duration) -> Result<Self, Self::Error> {
        TimeDelta::from_std(duration)
            .map(Expiration::Duration)
            .map_err(|_| QuotaError::InvalidReservationExpiration {
                expire: format!("{duration:?}"),
            })
    }
}

/// Accepts an integer number of seconds or an RFC 3339 timestamp.
impl FromStr for Expiration {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(secs) = s.parse::<i64>() {
            if secs < 0 {
                return Err(QuotaError::InvalidReservationExpiration {
                    expire: s.to_string(),
                });
            }
            return Ok(Expiration::Seconds(secs));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|at| Expiration::At(at.with_timezone(&Utc)))
            .map_err(|_| QuotaError::InvalidReservationExpiration {
                expire: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_seconds_offset() {
        let at = Expiration::from(3600).resolve(now()).unwrap();
        assert_eq!(at - now(), TimeDelta::hours(1));
    }

    #[test]
    fn test_duration_offset() {
        let at = Expiration::from(TimeDelta::days(1)).resolve(now()).unwrap();
        assert_eq!(at - now(), TimeDelta::seconds(86400));
    }

    #[test]
    fn test_absolute_timestamp_is_kept() {
        let target = now() + TimeDelta::minutes(5);
        assert_eq!(Expiration::At(target).resolve(now()).unwrap(), target);
    }

    #[test]
    fn test_negative_offsets_are_rejected() {
        assert!(matches!(
            Expiration::Seconds(-1).resolve(now()),
            Err(QuotaError::InvalidReservationExpiration { .. })
        ));
        assert!(Expiration::Duration(TimeDelta::seconds(-5))
            .resolve(now())
            .is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("60".parse::<Expiration>().unwrap(), Expiration::Seconds(60));
        assert_eq!(
            "2024-03-01T12:00:00Z".parse::<Expiration>().unwrap(),
            Expiration::At(now())
        );
        assert!("soon".parse::<Expiration>().is_err());
        assert!("-3".parse::<Expiration>().is_err());
    }

    #[test]
    fn test_from_std_duration() {
        let exp = Expiration::try_from(std::time::Duration::from_secs(30)).unwrap();
        assert_eq!(exp, Expiration::Duration(TimeDelta::seconds(30)));
    }
}
