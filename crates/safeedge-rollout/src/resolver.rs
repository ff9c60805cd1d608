//! Target resolver — selector validation, target ordering, cohort split.

use safeedge_state::{DeviceId, DeviceSelector, FleetRepository, SelectorField};

use crate::error::{RolloutError, RolloutResult};

/// A rollout's targets split into the first wave and the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cohorts {
    pub canary: Vec<DeviceId>,
    pub remainder: Vec<DeviceId>,
}

impl Cohorts {
    pub fn total(&self) -> usize {
        self.canary.len() + self.remainder.len()
    }
}

/// Reject selectors that could not match anything meaningful.
pub fn validate_selector(selector: &DeviceSelector) -> RolloutResult<()> {
    if selector.is_empty() {
        return Err(RolloutError::Validation(
            "selector must have at least one term".to_string(),
        ));
    }
    for (field, value) in selector.terms() {
        if SelectorField::parse(field).is_none() {
            return Err(RolloutError::Validation(format!(
                "unknown selector field '{field}' (expected group_tag, site_tag, platform or version)"
            )));
        }
        if value.is_empty() {
            return Err(RolloutError::Validation(format!(
                "selector field '{field}' has an empty value"
            )));
        }
    }
    Ok(())
}

/// Size of the canary cohort for `total` targets.
///
/// `ceil(percent * total / 100)`, at least 1 when there are targets and
/// `percent > 0`.
pub fn canary_size(total: usize, percent: u8) -> usize {
    if total == 0 || percent == 0 {
        return 0;
    }
    let percent = usize::from(percent.min(100));
    (percent * total).div_ceil(100).clamp(1, total)
}

/// Active devices of `org_id` matching `selector`, ordered by device id.
pub fn resolve_targets(
    repo: &dyn FleetRepository,
    org_id: &str,
    selector: &DeviceSelector,
) -> RolloutResult<Vec<DeviceId>> {
    let mut ids: Vec<DeviceId> = repo
        .list_active_devices_matching(org_id, selector)?
        .into_iter()
        .map(|d| d.id)
        .collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

/// Split ordered targets into canary and remainder.
pub fn partition(mut targets: Vec<DeviceId>, canary_percent: u8) -> Cohorts {
    let n = canary_size(targets.len(), canary_percent);
    let remainder = targets.split_off(n);
    Cohorts {
        canary: targets,
        remainder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safeedge_state::{Device, DeviceStatus, StateStore};

    fn device(id: &str, org: &str, group: &str, status: DeviceStatus) -> Device {
        Device {
            id: id.to_string(),
            org_id: org.to_string(),
            public_key: String::new(),
            tunnel_public_key: String::new(),
            tunnel_address: String::new(),
            platform: "linux/arm64".to_string(),
            version: "1.0.0".to_string(),
            group_tag: group.to_string(),
            status,
            last_seen_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn canary_size_rounds_up() {
        assert_eq!(canary_size(0, 20), 0);
        assert_eq!(canary_size(1, 20), 1);
        assert_eq!(canary_size(5, 20), 1);
        assert_eq!(canary_size(6, 20), 2);
        assert_eq!(canary_size(10, 20), 2);
        assert_eq!(canary_size(11, 20), 3);
        assert_eq!(canary_size(10, 10), 1);
        assert_eq!(canary_size(3, 1), 1);
        assert_eq!(canary_size(7, 100), 7);
        assert_eq!(canary_size(7, 0), 0);
    }

    #[test]
    fn canary_size_twenty_percent_property() {
        for n in 0..500usize {
            let expected = if n == 0 { 0 } else { (n * 20).div_ceil(100).max(1) };
            assert_eq!(canary_size(n, 20), expected, "n={n}");
        }
    }

    #[test]
    fn partition_keeps_order() {
        let targets: Vec<String> = (0..10).map(|i| format!("dev-{i:02}")).collect();
        let cohorts = partition(targets, 30);
        assert_eq!(cohorts.canary, vec!["dev-00", "dev-01", "dev-02"]);
        assert_eq!(cohorts.remainder.len(), 7);
        assert_eq!(cohorts.remainder[0], "dev-03");
        assert_eq!(cohorts.total(), 10);
    }

    #[test]
    fn selector_validation() {
        assert!(validate_selector(&DeviceSelector::new()).is_err());
        assert!(validate_selector(&DeviceSelector::new().with("region", "eu")).is_err());
        assert!(validate_selector(&DeviceSelector::new().with("site_tag", "")).is_err());
        assert!(validate_selector(&DeviceSelector::new().with("site_tag", "warehouse-5")).is_ok());
    }

    #[test]
    fn resolve_filters_org_status_and_sorts() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_device(&device("dev-c", "org-1", "wh-5", DeviceStatus::Active)).unwrap();
        store.put_device(&device("dev-a", "org-1", "wh-5", DeviceStatus::Active)).unwrap();
        store.put_device(&device("dev-b", "org-1", "wh-5", DeviceStatus::Suspended)).unwrap();
        store.put_device(&device("dev-d", "org-2", "wh-5", DeviceStatus::Active)).unwrap();
        store.put_device(&device("dev-e", "org-1", "wh-6", DeviceStatus::Active)).unwrap();
        store
            .put_device(&device("dev-f", "org-1", "wh-5", DeviceStatus::Decommissioned))
            .unwrap();

        let selector = DeviceSelector::new().with("site_tag", "wh-5");
        let ids = resolve_targets(&store, "org-1", &selector).unwrap();
        assert_eq!(ids, vec!["dev-a".to_string(), "dev-c".to_string()]);
    }
}
