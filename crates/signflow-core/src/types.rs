//! Core types for signflow
//!
//! Defines the identifiers and value types shared by every component:
//! - Document, field, signature block, and key identifiers
//! - Actors and roles
//! - Page geometry and bounding boxes
//! - Field and document lifecycle states
//! - Signature styling palette

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique document identifier
    DocumentId
);
uuid_id!(
    /// Unique sentinel block (field) identifier
    FieldId
);
uuid_id!(
    /// Unique content field identifier
    ContentFieldId
);
uuid_id!(
    /// Unique user identifier (owned by the user directory)
    UserId
);
uuid_id!(
    /// Unique signature block identifier
    SignatureBlockId
);
uuid_id!(
    /// Unique signing key identifier
    KeyId
);

/// Who is performing an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Acting user
    pub user: UserId,
    /// Administrators may act as a document owner
    pub admin: bool,
}

impl Actor {
    /// Regular user
    #[inline]
    #[must_use]
    pub fn user(user: UserId) -> Self {
        Self { user, admin: false }
    }

    /// Administrator
    #[inline]
    #[must_use]
    pub fn admin(user: UserId) -> Self {
        Self { user, admin: true }
    }
}

/// Kind of placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    /// Cryptographically signed field
    Signature,
    /// Free text field
    Text,
}

impl BlockType {
    /// Wire name of the block type
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::Signature => "SIGNATURE",
            BlockType::Text => "TEXT",
        }
    }

    /// Placeholder label used when none is supplied
    #[must_use]
    pub fn default_placeholder(self) -> String {
        format!("This is a {} placeholder", self.as_str())
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    /// Placed, waiting for its assignee
    Pending,
    /// Content supplied, not yet committed
    Filled,
    /// Committed with the rest of the document; immutable
    Finalized,
    /// Removed or voided; retained for audit
    Void,
}

impl FieldState {
    /// Whether the field counts toward document completion
    #[inline]
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(self, FieldState::Void)
    }
}

impl fmt::Display for FieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldState::Pending => "pending",
            FieldState::Filled => "filled",
            FieldState::Finalized => "finalized",
            FieldState::Void => "void",
        };
        f.write_str(s)
    }
}

/// Document lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Fields and roles may change
    Draft,
    /// Roles locked, signers filling fields
    AwaitingSignatures,
    /// All fields finalized
    Completed,
    /// Cancelled by the owner
    Voided,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::AwaitingSignatures => "awaiting_signatures",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Voided => "voided",
        };
        f.write_str(s)
    }
}

/// Size of a single page, in points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageBounds {
    /// Page width
    pub width: f64,
    /// Page height
    pub height: f64,
}

impl PageBounds {
    /// US Letter, 612 x 792 pt
    pub const LETTER: PageBounds = PageBounds {
        width: 612.0,
        height: 792.0,
    };

    /// Create page bounds
    #[inline]
    #[must_use]
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Region of a page a field is anchored to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Zero-based page index
    pub page: u32,
    /// Left edge
    pub x: f64,
    /// Top edge
    pub y: f64,
    /// Width
    pub width: f64,
    /// Height
    pub height: f64,
}

impl BoundingBox {
    /// Create a bounding box
    #[inline]
    #[must_use]
    pub fn new(page: u32, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            page,
            x,
            y,
            width,
            height,
        }
    }
}

/// Signature font palette
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FontFamily {
    /// "Dancing Script"
    #[serde(rename = "Dancing Script")]
    DancingScript,
    /// "Caveat"
    #[serde(rename = "Caveat")]
    Caveat,
    /// "Permanent Marker"
    #[serde(rename = "Permanent Marker")]
    PermanentMarker,
    /// "Rock Salt"
    #[serde(rename = "Rock Salt")]
    RockSalt,
    /// "Homemade Apple"
    #[serde(rename = "Homemade Apple")]
    HomemadeApple,
}

impl FontFamily {
    /// Every font in the palette
    pub const ALL: [FontFamily; 5] = [
        FontFamily::DancingScript,
        FontFamily::Caveat,
        FontFamily::PermanentMarker,
        FontFamily::RockSalt,
        FontFamily::HomemadeApple,
    ];

    /// CSS font-family name
    #[must_use]
    pub fn css_name(self) -> &'static str {
        match self {
            FontFamily::DancingScript => "Dancing Script",
            FontFamily::Caveat => "Caveat",
            FontFamily::PermanentMarker => "Permanent Marker",
            FontFamily::RockSalt => "Rock Salt",
            FontFamily::HomemadeApple => "Homemade Apple",
        }
    }
}

/// Signature ink palette
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InkColor {
    /// darkgreen
    DarkGreen,
    /// black
    Black,
    /// midnightblue
    MidnightBlue,
    /// royalblue
    RoyalBlue,
    /// darkslategray
    DarkSlateGray,
    /// teal
    Teal,
}

impl InkColor {
    /// Every color in the palette
    pub const ALL: [InkColor; 6] = [
        InkColor::DarkGreen,
        InkColor::Black,
        InkColor::MidnightBlue,
        InkColor::RoyalBlue,
        InkColor::DarkSlateGray,
        InkColor::Teal,
    ];

    /// CSS color keyword
    #[must_use]
    pub fn css_name(self) -> &'static str {
        match self {
            InkColor::DarkGreen => "darkgreen",
            InkColor::Black => "black",
            InkColor::MidnightBlue => "midnightblue",
            InkColor::RoyalBlue => "royalblue",
            InkColor::DarkSlateGray => "darkslategray",
            InkColor::Teal => "teal",
        }
    }
}

/// Visual style of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureStyle {
    /// Font
    #[serde(rename = "font-family")]
    pub font_family: FontFamily,
    /// Ink color
    pub color: InkColor,
}

impl Default for SignatureStyle {
    fn default() -> Self {
        Self {
            font_family: FontFamily::DancingScript,
            color: InkColor::Black,
        }
    }
}

/// Content-addressed reference into the blob store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef(pub String);

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_type_default_placeholder() {
        assert_eq!(
            BlockType::Signature.default_placeholder(),
            "This is a SIGNATURE placeholder"
        );
        assert_eq!(BlockType::Text.default_placeholder(), "This is a TEXT placeholder");
    }

    #[test]
    fn style_serializes_with_css_names() {
        let style = SignatureStyle {
            font_family: FontFamily::RockSalt,
            color: InkColor::MidnightBlue,
        };
        let json = serde_json::to_string(&style).unwrap();
        assert_eq!(json, r#"{"font-family":"Rock Salt","color":"midnightblue"}"#);
    }

    #[test]
    fn void_is_not_live() {
        assert!(FieldState::Pending.is_live());
        assert!(FieldState::Finalized.is_live());
        assert!(!FieldState::Void.is_live());
    }
}
