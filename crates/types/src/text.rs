//! Validated text newtypes.

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// The input text exceeded the maximum permitted length
    #[error("Text exceeds maximum length of {0} characters")]
    TooLong(usize),
    /// The input text contained embedded whitespace where none is allowed
    #[error("Text must not contain whitespace")]
    ContainsWhitespace,
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Arguments
    ///
    /// * `input` - Any type that can be converted to a string reference
    ///
    /// # Returns
    ///
    /// Returns `Ok(NonEmptyText)` if the trimmed input is non-empty,
    /// or `Err(TextError::Empty)` if it's empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for NonEmptyText {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// An address on the external messaging channel (a guardian's contact handle).
///
/// The engine treats the handle as opaque: it is validated only enough to be
/// safely forwarded to the channel provider. Trimmed on construction; must be
/// non-empty, contain no embedded whitespace, and stay within a conservative
/// length bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactHandle(String);

impl ContactHandle {
    /// Maximum accepted handle length in characters.
    pub const MAX_LEN: usize = 256;

    /// Creates a new `ContactHandle` from the given input.
    ///
    /// # Errors
    ///
    /// Returns `TextError::Empty` for empty/whitespace-only input,
    /// `TextError::ContainsWhitespace` for embedded whitespace, and
    /// `TextError::TooLong` when the handle exceeds [`Self::MAX_LEN`].
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(TextError::ContainsWhitespace);
        }
        if trimmed.chars().count() > Self::MAX_LEN {
            return Err(TextError::TooLong(Self::MAX_LEN));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContactHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for ContactHandle {
    type Err = TextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for ContactHandle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ContactHandle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContactHandle::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_text_trims_and_accepts() {
        let t = NonEmptyText::new("  Ada Lovelace  ").expect("valid text");
        assert_eq!(t.as_str(), "Ada Lovelace");
    }

    #[test]
    fn non_empty_text_rejects_whitespace_only() {
        assert!(matches!(NonEmptyText::new("   "), Err(TextError::Empty)));
    }

    #[test]
    fn contact_handle_rejects_embedded_whitespace() {
        assert!(matches!(
            ContactHandle::new("guardian one"),
            Err(TextError::ContainsWhitespace)
        ));
    }

    #[test]
    fn contact_handle_rejects_overlong_input() {
        let long = "a".repeat(ContactHandle::MAX_LEN + 1);
        assert!(matches!(
            ContactHandle::new(&long),
            Err(TextError::TooLong(_))
        ));
    }

    #[test]
    fn contact_handle_round_trips_through_serde() {
        let handle = ContactHandle::new("+44700900123").expect("valid handle");
        let json = serde_json::to_string(&handle).expect("serialize");
        let back: ContactHandle = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(handle, back);
    }
}
