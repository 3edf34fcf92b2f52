//! Room names.
//!
//! Rooms are named broadcast groups. A room exists in a hub only while it
//! has members; there is no separate create or delete step.

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("lobby").is_ok());
        assert!(validate_room_name("game:42 table").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("$system").is_err());
        assert!(validate_room_name("tab\there").is_err());
        assert!(validate_room_name("caf\u{e9}").is_err());

        let long_name = "a".repeat(MAX_ROOM_NAME_LENGTH + 1);
        assert!(validate_room_name(&long_name).is_err());
        assert!(validate_room_name(&long_name[1..]).is_ok());
    }
}
