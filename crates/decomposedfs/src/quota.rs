//! Space quota arithmetic.
//!
//! The quota attribute of a space root holds either a byte count or one of
//! the sentinels in [`crate::attrs`]. Usage is the tree size of the root.

use serde::{Deserialize, Serialize};

use crate::attrs;
use crate::error::{FsError, FsResult};

/// Quota figures reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Quota in bytes, 0 when unlimited or unknown.
    pub total: u64,
    /// Bytes in use.
    pub used: u64,
    /// Bytes left, `u64::MAX` when there is no limit to compute against.
    pub remaining: u64,
}

/// Computes total, used and remaining bytes from a raw quota attribute.
pub fn usage(quota: Option<&str>, used: u64) -> FsResult<QuotaUsage> {
    let quota = quota.unwrap_or(attrs::QUOTA_UNKNOWN);
    let mut out = QuotaUsage {
        total: 0,
        used,
        remaining: u64::MAX,
    };
    match quota {
        attrs::QUOTA_UNCALCULATED | attrs::QUOTA_UNKNOWN | attrs::QUOTA_UNLIMITED => {}
        q => {
            let total: u64 = q
                .parse()
                .map_err(|e| FsError::Internal(format!("malformed quota {:?}: {}", q, e)))?;
            out.total = total;
            out.remaining = total.saturating_sub(used);
        }
    }
    Ok(out)
}

/// Checks whether writing `new_size` bytes fits the quota.
///
/// With `overwrite` the write replaces `old_size` bytes of an existing file.
/// Unset, unlimited, uncalculated and unknown quotas always pass.
pub fn check(quota: Option<&str>, used: u64, overwrite: bool, old_size: u64, new_size: u64) -> FsResult<()> {
    let q = match quota {
        None | Some("") => return Ok(()),
        Some(attrs::QUOTA_UNLIMITED) | Some(attrs::QUOTA_UNCALCULATED) | Some(attrs::QUOTA_UNKNOWN) => {
            return Ok(())
        }
        Some(q) => q,
    };
    let limit: u64 = q
        .parse()
        .map_err(|e| FsError::Internal(format!("malformed quota {:?}: {}", q, e)))?;
    let fits = if overwrite {
        used.saturating_sub(old_size).saturating_add(new_size) <= limit
    } else {
        new_size <= limit.saturating_sub(used)
    };
    if fits {
        Ok(())
    } else {
        Err(FsError::PreconditionFailed("quota exceeded".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_usage_sentinels() {
        let u = usage(Some(attrs::QUOTA_UNLIMITED), 10).unwrap();
        assert_eq!((u.total, u.used, u.remaining), (0, 10, u64::MAX));
        let u = usage(Some(attrs::QUOTA_UNKNOWN), 10).unwrap();
        assert_eq!(u.remaining, u64::MAX);
        let u = usage(None, 10).unwrap();
        assert_eq!(u.remaining, u64::MAX);
        let u = usage(Some(attrs::QUOTA_UNCALCULATED), 10).unwrap();
        assert_eq!(u.total, 0);
    }

    #[test]
    fn test_usage_with_limit() {
        let u = usage(Some("1000"), 100).unwrap();
        assert_eq!((u.total, u.used, u.remaining), (1000, 100, 900));
        let u = usage(Some("50"), 100).unwrap();
        assert_eq!(u.remaining, 0);
        assert!(usage(Some("lots"), 0).is_err());
    }

    #[test]
    fn test_check_new_file() {
        check(Some("1000"), 900, false, 0, 100).unwrap();
        match check(Some("1000"), 900, false, 0, 101) {
            Err(FsError::PreconditionFailed(m)) => assert_eq!(m, "quota exceeded"),
            other => panic!("expected PreconditionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_check_overwrite() {
        check(Some("1000"), 1000, true, 100, 100).unwrap();
        assert!(check(Some("1000"), 1000, true, 100, 101).is_err());
    }

    #[test]
    fn test_check_unlimited() {
        check(None, u64::MAX, false, 0, u64::MAX).unwrap();
        check(Some(attrs::QUOTA_UNLIMITED), 5, false, 0, 1 << 40).unwrap();
        check(Some(attrs::QUOTA_UNKNOWN), 5, false, 0, 1 << 40).unwrap();
    }

    proptest! {
        #[test]
        fn prop_remaining_never_exceeds_total(total in 1u64..u64::MAX, used in any::<u64>()) {
            let u = usage(Some(&total.to_string()), used).unwrap();
            prop_assert!(u.remaining <= u.total);
            prop_assert_eq!(u.remaining, total.saturating_sub(used));
        }

        #[test]
        fn prop_check_agrees_with_remaining(total in 0u64..1_000_000, used in 0u64..1_000_000, size in 0u64..1_000_000) {
            let q = total.to_string();
            let ok = check(Some(&q), used, false, 0, size).is_ok();
            // "0" is the unlimited sentinel
            let expected = total == 0 || size <= total.saturating_sub(used);
            prop_assert_eq!(ok, expected);
        }
    }
}
