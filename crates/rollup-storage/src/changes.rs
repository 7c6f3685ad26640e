//! Rollup Changes - Change Capture Records
//!
//! Change records published by a store for every write that alters a
//! captured table. Consumers receive the new image and, for modifications,
//! the previous one.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use rollup_common::{AggregatedRecord, Granularity};

/// Kind of change applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Modify,
}

/// One captured write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub table: String,
    pub granularity: Granularity,
    pub kind: ChangeKind,
    pub new_image: AggregatedRecord,
    pub old_image: Option<AggregatedRecord>,
}

impl ChangeRecord {
    /// Build the record for a write, or `None` when nothing changed.
    pub fn from_write(
        table: &str,
        granularity: Granularity,
        old_image: Option<&AggregatedRecord>,
        new_image: &AggregatedRecord,
    ) -> Option<Self> {
        if old_image == Some(new_image) {
            return None;
        }
        let kind = if old_image.is_some() {
            ChangeKind::Modify
        } else {
            ChangeKind::Insert
        };
        Some(Self {
            table: table.to_string(),
            granularity,
            kind,
            new_image: new_image.clone(),
            old_image: old_image.cloned(),
        })
    }

    /// Previous value when this change overwrote an existing record.
    pub fn old_value(&self) -> Option<f64> {
        self.old_image.as_ref().map(|r| r.value)
    }
}
