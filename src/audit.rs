use chrono::{DateTime, Utc};
use serde::Serialize;

/// Creation and last-update stamps carried by every stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Audit {
    pub created_by: Option<String>,
    pub created_date: DateTime<Utc>,
    pub update_by: Option<String>,
    pub update_date: Option<DateTime<Utc>>,
}

impl Audit {
    pub fn created(by: Option<String>) -> Self {
        Self {
            created_by: by,
            created_date: Utc::now(),
            update_by: None,
            update_date: None,
        }
    }

    pub fn touch(&mut self, by: Option<&str>) {
        self.update_by = by.map(ToOwned::to_owned);
        self.update_date = Some(Utc::now());
    }
}
