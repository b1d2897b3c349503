use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{HealthRecord, User};

/// Read-only access to users and their daily health records.
pub trait RecordStore: Send + Sync {
    fn all_users(&self) -> &[User];

    /// All records for a user, in no particular order. Unknown users yield an empty slice.
    fn records_for_user(&self, user_id: Uuid) -> &[HealthRecord];
}

/// More than one record stored for the same user and day.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateDay {
    pub user_id: Uuid,
    pub recorded_date: NaiveDate,
    pub count: usize,
}

/// Point-in-time snapshot of the record store held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Vec<User>,
    records: HashMap<Uuid, Vec<HealthRecord>>,
    duplicates: Vec<DuplicateDay>,
}

impl MemoryStore {
    pub fn new(users: Vec<User>, records: Vec<HealthRecord>) -> Self {
        let mut grouped: HashMap<Uuid, Vec<HealthRecord>> = HashMap::new();
        for record in records {
            grouped.entry(record.user_id).or_default().push(record);
        }

        let mut duplicates = Vec::new();
        for (user_id, user_records) in grouped.iter() {
            let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
            for record in user_records {
                *per_day.entry(record.recorded_date).or_insert(0) += 1;
            }
            for (recorded_date, count) in per_day {
                if count > 1 {
                    tracing::warn!(
                        %user_id,
                        %recorded_date,
                        count,
                        "duplicate health records for one day; aggregating all of them"
                    );
                    duplicates.push(DuplicateDay {
                        user_id: *user_id,
                        recorded_date,
                        count,
                    });
                }
            }
        }
        duplicates.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then(a.recorded_date.cmp(&b.recorded_date))
        });

        tracing::debug!(
            users = users.len(),
            users_with_records = grouped.len(),
            "record snapshot loaded"
        );

        Self {
            users,
            records: grouped,
            duplicates,
        }
    }

    pub fn duplicate_days(&self) -> &[DuplicateDay] {
        &self.duplicates
    }

    pub fn user(&self, user_id: Uuid) -> Option<&User> {
        self.users.iter().find(|user| user.id == user_id)
    }
}

impl RecordStore for MemoryStore {
    fn all_users(&self) -> &[User] {
        &self.users
    }

    fn records_for_user(&self, user_id: Uuid) -> &[HealthRecord] {
        self.records
            .get(&user_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn groups_records_by_user() {
        let avery = user("avery", 30);
        let jules = user("jules", 30);
        let store = MemoryStore::new(
            vec![avery.clone(), jules.clone()],
            vec![
                record(&avery, days_ago(1), 100.0, 10.0, &[]),
                record(&avery, days_ago(2), 200.0, 10.0, &[]),
                record(&jules, days_ago(1), 300.0, 10.0, &[]),
            ],
        );

        assert_eq!(store.all_users().len(), 2);
        assert_eq!(store.records_for_user(avery.id).len(), 2);
        assert_eq!(store.records_for_user(jules.id).len(), 1);
        assert!(store.records_for_user(Uuid::new_v4()).is_empty());
        assert_eq!(store.user(jules.id).map(|u| u.username.as_str()), Some("jules"));
    }

    #[test]
    fn reports_duplicate_days_but_keeps_records() {
        let avery = user("avery", 30);
        let store = MemoryStore::new(
            vec![avery.clone()],
            vec![
                record(&avery, today(), 12000.0, 10.0, &[]),
                record(&avery, today(), 500.0, 10.0, &[]),
                record(&avery, days_ago(1), 500.0, 10.0, &[]),
            ],
        );

        assert_eq!(
            store.duplicate_days(),
            &[DuplicateDay {
                user_id: avery.id,
                recorded_date: today(),
                count: 2,
            }]
        );
        assert_eq!(store.records_for_user(avery.id).len(), 3);
    }
}
