use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification delivered by the store's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<T> {
    pub event_type: ChangeEventType,
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T> ChangeEvent<T> {
    pub fn insert(new: T) -> Self {
        ChangeEvent {
            event_type: ChangeEventType::Insert,
            old: None,
            new: Some(new),
        }
    }

    pub fn update(old: Option<T>, new: T) -> Self {
        ChangeEvent {
            event_type: ChangeEventType::Update,
            old,
            new: Some(new),
        }
    }
}
