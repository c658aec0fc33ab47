//! Learn-string layout tables and diffing
//!
//! The learn string is a firmware-specific dump of the full instrument state.
//! A handful of settings cannot be queried directly, so they are recovered from
//! known offsets. The tables are advisory: they were found by diffing learn
//! strings before and after toggling a setting, which is what
//! [`diff_learn_strings`] supports.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// How a field is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single bit flag
    Flag(u8),
    U8,
    /// Big-endian u16
    U16,
    /// Big-endian IEEE-754 double
    F64,
}

impl FieldKind {
    fn width(self) -> usize {
        match self {
            FieldKind::Flag(_) | FieldKind::U8 => 1,
            FieldKind::U16 => 2,
            FieldKind::F64 => 8,
        }
    }
}

/// A named setting at a fixed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnField {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
}

/// Field table valid for a firmware revision range (inclusive lower bound)
#[derive(Debug, Clone, Copy)]
pub struct LearnStringLayout {
    pub firmware_min: f32,
    pub firmware_max: f32,
    pub fields: &'static [LearnField],
}

static LAYOUT_5X: &[LearnField] = &[
    LearnField {
        name: "source_coupled",
        offset: 0x0146,
        kind: FieldKind::Flag(0x01),
    },
    LearnField {
        name: "channels_coupled",
        offset: 0x0146,
        kind: FieldKind::Flag(0x02),
    },
    LearnField {
        name: "dual_channel",
        offset: 0x0151,
        kind: FieldKind::Flag(0x04),
    },
    LearnField {
        name: "smith_marker_format",
        offset: 0x01A2,
        kind: FieldKind::U8,
    },
];

static LAYOUT_6X: &[LearnField] = &[
    LearnField {
        name: "source_coupled",
        offset: 0x0152,
        kind: FieldKind::Flag(0x01),
    },
    LearnField {
        name: "channels_coupled",
        offset: 0x0152,
        kind: FieldKind::Flag(0x02),
    },
    LearnField {
        name: "dual_channel",
        offset: 0x015D,
        kind: FieldKind::Flag(0x04),
    },
    LearnField {
        name: "split_display",
        offset: 0x015D,
        kind: FieldKind::Flag(0x08),
    },
    LearnField {
        name: "smith_marker_format",
        offset: 0x01B6,
        kind: FieldKind::U8,
    },
    LearnField {
        name: "polar_marker_format",
        offset: 0x01B7,
        kind: FieldKind::U8,
    },
];

static LAYOUT_7X: &[LearnField] = &[
    LearnField {
        name: "source_coupled",
        offset: 0x0162,
        kind: FieldKind::Flag(0x01),
    },
    LearnField {
        name: "channels_coupled",
        offset: 0x0162,
        kind: FieldKind::Flag(0x02),
    },
    LearnField {
        name: "dual_channel",
        offset: 0x016D,
        kind: FieldKind::Flag(0x04),
    },
    LearnField {
        name: "split_display",
        offset: 0x016D,
        kind: FieldKind::Flag(0x08),
    },
    LearnField {
        name: "smith_marker_format",
        offset: 0x01C6,
        kind: FieldKind::U8,
    },
    LearnField {
        name: "polar_marker_format",
        offset: 0x01C7,
        kind: FieldKind::U8,
    },
    LearnField {
        name: "sweep_delay_ms",
        offset: 0x01D0,
        kind: FieldKind::U16,
    },
];

/// Known layouts, ordered by firmware
pub const LAYOUTS: &[LearnStringLayout] = &[
    LearnStringLayout {
        firmware_min: 5.0,
        firmware_max: 6.0,
        fields: LAYOUT_5X,
    },
    LearnStringLayout {
        firmware_min: 6.0,
        firmware_max: 7.0,
        fields: LAYOUT_6X,
    },
    LearnStringLayout {
        firmware_min: 7.0,
        firmware_max: 8.0,
        fields: LAYOUT_7X,
    },
];

/// Layout for a firmware revision, if one is known
pub fn layout_for(revision: f32) -> Option<&'static LearnStringLayout> {
    LAYOUTS
        .iter()
        .find(|layout| revision >= layout.firmware_min && revision < layout.firmware_max)
}

/// Value of a recovered setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    Flag(bool),
    Integer(i64),
    Real(f64),
}

/// A setting read from the learn string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredSetting {
    pub name: String,
    pub value: SettingValue,
}

/// Read every field of `layout` that fits inside `blob`
pub fn recover_settings(layout: &LearnStringLayout, blob: &[u8]) -> Vec<RecoveredSetting> {
    layout
        .fields
        .iter()
        .filter(|field| field.offset + field.kind.width() <= blob.len())
        .map(|field| {
            let bytes = &blob[field.offset..field.offset + field.kind.width()];
            let value = match field.kind {
                FieldKind::Flag(mask) => SettingValue::Flag(bytes[0] & mask != 0),
                FieldKind::U8 => SettingValue::Integer(bytes[0] as i64),
                FieldKind::U16 => SettingValue::Integer(BigEndian::read_u16(bytes) as i64),
                FieldKind::F64 => SettingValue::Real(BigEndian::read_f64(bytes)),
            };
            RecoveredSetting {
                name: field.name.to_string(),
                value,
            }
        })
        .collect()
}

/// One differing byte between two learn strings
///
/// `None` marks a byte present in only one of the two blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnDiff {
    pub offset: usize,
    pub before: Option<u8>,
    pub after: Option<u8>,
}

impl LearnDiff {
    /// Bits that flipped, when both bytes exist
    pub fn changed_bits(&self) -> Option<u8> {
        Some(self.before? ^ self.after?)
    }
}

/// Byte-wise comparison of a baseline and a modified learn string
pub fn diff_learn_strings(baseline: &[u8], modified: &[u8]) -> Vec<LearnDiff> {
    let len = baseline.len().max(modified.len());
    (0..len)
        .filter_map(|offset| {
            let before = baseline.get(offset).copied();
            let after = modified.get(offset).copied();
            (before != after).then_some(LearnDiff {
                offset,
                before,
                after,
            })
        })
        .collect()
}

/// Collapse adjacent diffs into `(first_offset, length)` runs
pub fn diff_runs(diffs: &[LearnDiff]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for diff in diffs {
        match runs.last_mut() {
            Some((start, len)) if *start + *len == diff.offset => *len += 1,
            _ => runs.push((diff.offset, 1)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_selection() {
        assert!(std::ptr::eq(layout_for(6.14).unwrap().fields, LAYOUT_6X));
        assert!(std::ptr::eq(layout_for(5.48).unwrap().fields, LAYOUT_5X));
        assert!(layout_for(4.13).is_none());
        assert!(layout_for(8.0).is_none());
    }

    #[test]
    fn test_recover_settings() {
        let mut blob = vec![0u8; 0x200];
        blob[0x0152] = 0x02;
        blob[0x015D] = 0x0C;
        blob[0x01B6] = 3;

        let layout = layout_for(6.14).unwrap();
        let settings = recover_settings(layout, &blob);
        let get = |name: &str| {
            settings
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.value)
                .unwrap()
        };

        assert_eq!(get("source_coupled"), SettingValue::Flag(false));
        assert_eq!(get("channels_coupled"), SettingValue::Flag(true));
        assert_eq!(get("dual_channel"), SettingValue::Flag(true));
        assert_eq!(get("split_display"), SettingValue::Flag(true));
        assert_eq!(get("smith_marker_format"), SettingValue::Integer(3));
    }

    #[test]
    fn test_recover_skips_short_blob() {
        let layout = layout_for(7.4).unwrap();
        let settings = recover_settings(layout, &[0u8; 0x100]);
        assert!(settings.is_empty());
    }

    #[test]
    fn test_diff_learn_strings() {
        let baseline = [0x00, 0x11, 0x22, 0x33];
        let modified = [0x00, 0x10, 0x23, 0x33, 0x44];

        let diffs = diff_learn_strings(&baseline, &modified);
        assert_eq!(diffs.len(), 3);
        assert_eq!(diffs[0].offset, 1);
        assert_eq!(diffs[0].changed_bits(), Some(0x01));
        assert_eq!(diffs[2].before, None);
        assert_eq!(diffs[2].after, Some(0x44));
        assert_eq!(diffs[2].changed_bits(), None);

        assert_eq!(diff_runs(&diffs), vec![(1, 2), (4, 1)]);
    }

    #[test]
    fn test_identical_blobs_have_no_diff() {
        let blob = [1u8, 2, 3];
        assert!(diff_learn_strings(&blob, &blob).is_empty());
    }
}
