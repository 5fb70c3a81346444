use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Row-level action that produced a change.
///
/// wal2json format version 2 encodes the action as a single character;
/// `FromStr` parses that code and `Display` renders it back.
#[derive(
    Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
pub enum Action {
    #[strum(serialize = "I")]
    Insert,
    #[strum(serialize = "U")]
    Update,
    #[strum(serialize = "D")]
    Delete,
    #[strum(serialize = "T")]
    Truncate,
}
