//! Committed strokes and the room/user records that accompany them.

use crate::color::StrokeColor;
use crate::path::{InProgressPath, PathParseError, parse_svg_path};
use crate::tools::{ToolError, validate_thickness};
use kurbo::BezPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a room.
    RoomId
);
string_id!(
    /// Identifier of a user.
    UserId
);
string_id!(
    /// Store-assigned identifier of a committed stroke.
    StrokeId
);

/// Store-assigned ordering key. Strictly increasing within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A drawing action that has been appended to a room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: StrokeId,
    /// SVG path data.
    pub path: String,
    pub color: StrokeColor,
    pub thickness: f64,
    pub author_id: UserId,
    pub sequence: Sequence,
}

impl Stroke {
    /// Assemble the committed form of a draft.
    pub fn commit(draft: StrokeDraft, id: StrokeId, sequence: Sequence) -> Self {
        Self {
            id,
            path: draft.path,
            color: draft.color,
            thickness: draft.thickness,
            author_id: draft.author_id,
            sequence,
        }
    }

    /// Decode the path data.
    pub fn bez_path(&self) -> Result<BezPath, PathParseError> {
        parse_svg_path(&self.path)
    }
}

/// Why a draft was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DraftError {
    #[error("stroke path is empty")]
    EmptyPath,
    #[error(transparent)]
    Thickness(#[from] ToolError),
    #[error(transparent)]
    Path(#[from] PathParseError),
}

/// A stroke as submitted for append: everything but `id` and `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeDraft {
    pub path: String,
    pub color: StrokeColor,
    pub thickness: f64,
    pub author_id: UserId,
}

impl StrokeDraft {
    /// Serialize a local path. Returns `None` for an empty path.
    pub fn from_path(path: &InProgressPath, author_id: UserId) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Self {
            path: path.to_svg(),
            color: path.color,
            thickness: path.thickness,
            author_id,
        })
    }

    /// Check that the draft describes a drawable stroke.
    pub fn validate(&self) -> Result<(), DraftError> {
        validate_thickness(self.thickness)?;
        let path = parse_svg_path(&self.path)?;
        if path.elements().is_empty() {
            return Err(DraftError::EmptyPath);
        }
        Ok(())
    }
}

/// The ordered strokes of a room as last reported by the store.
///
/// Cheap to clone; a new update replaces the whole list.
#[derive(Debug, Clone, Default)]
pub struct CommittedStrokes(Arc<[Stroke]>);

impl CommittedStrokes {
    pub fn new(strokes: Vec<Stroke>) -> Self {
        Self(Arc::from(strokes))
    }

    /// Highest sequence key, if any stroke is committed.
    pub fn max_sequence(&self) -> Option<Sequence> {
        self.0.iter().map(|s| s.sequence).max()
    }

    /// Whether sequence keys strictly increase along the list.
    pub fn is_ordered(&self) -> bool {
        self.0.windows(2).all(|w| w[0].sequence < w[1].sequence)
    }

    /// Whether `previous` is a prefix of this list (by stroke id).
    pub fn extends(&self, previous: &CommittedStrokes) -> bool {
        previous.len() <= self.len()
            && previous
                .iter()
                .zip(self.iter())
                .all(|(old, new)| old.id == new.id)
    }

    /// Whether both values share the same underlying list.
    pub fn ptr_eq(&self, other: &CommittedStrokes) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for CommittedStrokes {
    type Target = [Stroke];

    fn deref(&self) -> &[Stroke] {
        &self.0
    }
}

impl From<Vec<Stroke>> for CommittedStrokes {
    fn from(strokes: Vec<Stroke>) -> Self {
        Self::new(strokes)
    }
}

/// Room metadata as seen by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub exists: bool,
    pub members: Vec<UserId>,
    pub name: String,
    pub created_by: Option<UserId>,
}

impl RoomSnapshot {
    /// Snapshot of a room that does not (or no longer) exist.
    pub fn missing() -> Self {
        Self {
            exists: false,
            members: Vec::new(),
            name: String::new(),
            created_by: None,
        }
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }
}

/// Room listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: UserId,
    pub name: String,
    pub email: String,
    pub reg_no: String,
    #[serde(default)]
    pub rooms: Vec<RoomId>,
}
