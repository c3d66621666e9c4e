//! Per-user overview of sent and received capsules.

use std::collections::BTreeMap;

use capsule_shared::constants::UPCOMING_WINDOW_DAYS;
use capsule_shared::ContentKind;
use capsule_store::Capsule;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total_capsules: usize,
    pub locked_capsules: usize,
    pub unlocked_capsules: usize,
    pub upcoming_unlocks: usize,
    pub type_breakdown: BTreeMap<ContentKind, usize>,
}

#[derive(Debug, Clone)]
pub struct Dashboard {
    pub stats: DashboardStats,
    pub locked: Vec<Capsule>,
    pub unlocked: Vec<Capsule>,
    /// Locked capsules due within the upcoming window, soonest first.
    /// Overdue capsules the scheduler has not reached yet are included.
    pub upcoming: Vec<Capsule>,
}

impl Dashboard {
    pub fn build(capsules: Vec<Capsule>, now: DateTime<Utc>) -> Self {
        let horizon = now + Duration::days(UPCOMING_WINDOW_DAYS);

        let mut type_breakdown = BTreeMap::new();
        for capsule in &capsules {
            *type_breakdown.entry(capsule.content_kind).or_insert(0) += 1;
        }

        let total_capsules = capsules.len();
        let (unlocked, locked): (Vec<_>, Vec<_>) =
            capsules.into_iter().partition(Capsule::is_unlocked);

        let mut upcoming: Vec<Capsule> = locked
            .iter()
            .filter(|c| c.unlock_at <= horizon)
            .cloned()
            .collect();
        upcoming.sort_by_key(|c| c.unlock_at);

        Self {
            stats: DashboardStats {
                total_capsules,
                locked_capsules: locked.len(),
                unlocked_capsules: unlocked.len(),
                upcoming_unlocks: upcoming.len(),
                type_breakdown,
            },
            locked,
            unlocked,
            upcoming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_shared::{CapsuleId, PayloadRef, Recipient, UserId};
    use capsule_store::CapsuleState;

    fn capsule(unlock_at: DateTime<Utc>, state: CapsuleState, kind: ContentKind) -> Capsule {
        Capsule {
            id: CapsuleId::new(),
            owner_id: UserId::from("alice"),
            recipient: Recipient::User(UserId::from("bob")),
            unlock_at,
            state,
            unlocked_at: (state == CapsuleState::Unlocked).then_some(unlock_at),
            ciphertext_ref: PayloadRef("ref".into()),
            nonce: [0u8; 24],
            description: None,
            filename: "x.txt".into(),
            content_kind: kind,
            original_size: 1,
            created_at: unlock_at - Duration::days(30),
        }
    }

    #[test]
    fn counts_and_upcoming_window() {
        let now = Utc::now();
        let in_three_days = capsule(now + Duration::days(3), CapsuleState::Locked, ContentKind::Image);
        let tomorrow = capsule(now + Duration::days(1), CapsuleState::Locked, ContentKind::Text);
        let next_month = capsule(now + Duration::days(30), CapsuleState::Locked, ContentKind::Text);
        let opened = capsule(now - Duration::days(2), CapsuleState::Unlocked, ContentKind::Audio);

        let dashboard = Dashboard::build(
            vec![
                in_three_days.clone(),
                tomorrow.clone(),
                next_month,
                opened.clone(),
            ],
            now,
        );

        assert_eq!(dashboard.stats.total_capsules, 4);
        assert_eq!(dashboard.stats.locked_capsules, 3);
        assert_eq!(dashboard.stats.unlocked_capsules, 1);
        assert_eq!(dashboard.stats.upcoming_unlocks, 2);
        assert_eq!(
            dashboard.upcoming.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![tomorrow.id, in_three_days.id]
        );
        assert_eq!(dashboard.unlocked, vec![opened]);
        assert_eq!(dashboard.stats.type_breakdown[&ContentKind::Text], 2);
        assert_eq!(dashboard.stats.type_breakdown[&ContentKind::Image], 1);
        assert_eq!(dashboard.stats.type_breakdown[&ContentKind::Audio], 1);
        assert!(!dashboard.stats.type_breakdown.contains_key(&ContentKind::Video));
    }

    #[test]
    fn overdue_locked_capsule_is_upcoming() {
        let now = Utc::now();
        let late = capsule(now - Duration::minutes(5), CapsuleState::Locked, ContentKind::Other);

        let dashboard = Dashboard::build(vec![late.clone()], now);
        assert_eq!(dashboard.upcoming, vec![late]);
    }

    #[test]
    fn breakdown_serializes_with_kind_names() {
        let now = Utc::now();
        let dashboard = Dashboard::build(
            vec![capsule(now, CapsuleState::Locked, ContentKind::Video)],
            now,
        );
        let json = serde_json::to_value(&dashboard.stats).unwrap();
        assert_eq!(json["type_breakdown"]["video"], 1);
    }
}
