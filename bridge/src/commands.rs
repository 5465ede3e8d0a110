//! In-game console commands issued by the subsystems.

use protocol::Coordinate;

use crate::model::{Zone, ZoneColor};

/// Strips characters that would break out of a quoted argument.
fn quote(arg: &str) -> String {
    let clean: String = arg.chars().filter(|c| *c != '"' && !c.is_control()).collect();
    format!("\"{}\"", clean)
}

pub fn give_kit(kit: &str, player: &str) -> String {
    format!("kit givetoplayer {} {}", kit, quote(player))
}

pub fn create_zone(zone: &Zone) -> String {
    let c = zone.center;
    format!(
        "zones.createcustomzone {} ({},{},{}) 0 Sphere {} 0 0 0 0 0",
        quote(&zone.name()),
        c.x,
        c.y,
        c.z,
        zone.radius
    )
}

pub fn recolor_zone(zone: &Zone, color: ZoneColor) -> String {
    let (r, g, b) = color.rgb();
    format!("zones.editcustomzone {} color ({},{},{})", quote(&zone.name()), r, g, b)
}

pub fn delete_zone(zone: &Zone) -> String {
    format!("zones.deletecustomzone {}", quote(&zone.name()))
}

pub fn teleport(player: &str, position: &Coordinate) -> String {
    format!("teleportpos {} {}", quote(&position.to_string()), quote(player))
}

const ERROR_MARKERS: [&str; 7] = [
    "error",
    "invalid",
    "unknown command",
    "couldn't find",
    "could not find",
    "failed",
    "not found",
];

const MISSING_MARKERS: [&str; 3] = ["not found", "couldn't find", "could not find"];

/// Lowercased body with every echoed argument blanked out, longest first.
fn without_echoes(body: &str, echoed: &[&str]) -> String {
    let mut args: Vec<String> = echoed
        .iter()
        .filter(|arg| !arg.is_empty())
        .map(|arg| arg.to_lowercase())
        .collect();
    args.sort_by_key(|arg| std::cmp::Reverse(arg.len()));

    let mut text = body.to_lowercase();
    for arg in args {
        text = text.replace(&arg, " ");
    }
    text
}

/// True if `word` appears in `text` not glued to other letters or digits.
fn contains_word(text: &str, word: &str) -> bool {
    text.match_indices(word).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + word.len()..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

/// True if a command response reports that the command failed.
///
/// `echoed` holds the arguments of the command (player, kit, zone name).
/// The server repeats them in its replies, so they are ignored when looking
/// for error wording.
pub fn response_is_error(body: &str, echoed: &[&str]) -> bool {
    let text = without_echoes(body, echoed);
    ERROR_MARKERS.iter().any(|marker| contains_word(&text, marker))
}

/// True if a delete failed only because the zone is already gone.
pub fn response_is_missing(body: &str, echoed: &[&str]) -> bool {
    let text = without_echoes(body, echoed);
    MISSING_MARKERS.iter().any(|marker| contains_word(&text, marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ServerId;

    #[test]
    fn test_give_kit_quotes_player() {
        assert_eq!(give_kit("starter", "alice"), "kit givetoplayer starter \"alice\"");
        assert_eq!(
            give_kit("starter", "evil\"; quit"),
            "kit givetoplayer starter \"evil; quit\""
        );
    }

    #[test]
    fn test_zone_commands() {
        let zone = Zone::new(
            ServerId::new("s"),
            "alice",
            Coordinate::new(10.0, 20.5, -3.0),
            50.0,
            0,
        );

        assert_eq!(
            create_zone(&zone),
            "zones.createcustomzone \"ZORP_alice\" (10,20.5,-3) 0 Sphere 50 0 0 0 0 0"
        );
        assert_eq!(
            recolor_zone(&zone, ZoneColor::Yellow),
            "zones.editcustomzone \"ZORP_alice\" color (255,255,0)"
        );
        assert_eq!(delete_zone(&zone), "zones.deletecustomzone \"ZORP_alice\"");
    }

    #[test]
    fn test_teleport_command() {
        let cmd = teleport("bob", &Coordinate::new(1.0, 2.0, 3.0));
        assert_eq!(cmd, "teleportpos \"1.00,2.00,3.00\" \"bob\"");
    }

    #[test]
    fn test_error_detection() {
        assert!(response_is_error("Couldn't find player alice", &["alice"]));
        assert!(response_is_error("Unknown command: kit", &[]));
        assert!(response_is_error("Invalid kit name", &["starter"]));
        assert!(!response_is_error("", &[]));
        assert!(!response_is_error("Gave kit starter to alice", &["starter", "alice"]));

        assert!(response_is_missing("Zone ZORP_alice not found", &["ZORP_alice"]));
        assert!(!response_is_missing("Error: permission denied", &["ZORP_alice"]));
    }

    #[test]
    fn test_echoed_names_are_not_errors() {
        assert!(!response_is_error(
            "Gave kit starter to TerrorBear",
            &["starter", "TerrorBear"]
        ));
        assert!(!response_is_error("Gave kit failed-raid to bob", &["failed-raid", "bob"]));
        assert!(!response_is_error("Created zone ZORP_error", &["ZORP_error"]));
        assert!(!response_is_missing("Deleted zone ZORP_notfound", &["ZORP_notfound"]));

        // Marker words inside other words are not errors either.
        assert!(!response_is_error("Teleported Invalidator", &[]));
        assert!(response_is_error("Couldn't find player TerrorBear", &["TerrorBear"]));
    }
}
