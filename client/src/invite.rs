use url::Url;
use urlencoding::{decode, encode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    pub room_id: String,
    /// Relay the room lives on, when it is not one of the default endpoints.
    pub server_url: Option<String>,
}

pub fn build_invite_url(room_id: &str, server_url: Option<&str>) -> String {
    let mut params = vec![format!("room={}", encode(room_id))];
    if let Some(server) = server_url.filter(|s| !s.is_empty()) {
        params.push(format!("server={}", encode(server)));
    }
    format!("lockstep://join?{}", params.join("&"))
}

/// Accepts a full invite link, an http(s) link carrying the same query, or
/// a bare `room=...` query.
pub fn parse_invite_url(input: &str) -> Option<InviteLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with("lockstep://")
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else {
        format!("lockstep://join?{}", trimmed)
    };

    let url = Url::parse(&normalized).ok()?;
    let mut room_id = None;
    let mut server_url = None;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "room" => room_id = decode(&value).ok().map(|v| v.into_owned()),
            "server" => server_url = decode(&value).ok().map(|v| v.into_owned()),
            _ => {}
        }
    }

    let room_id = room_id.filter(|r| !r.is_empty())?;
    Some(InviteLink {
        room_id,
        server_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_round_trip_with_server() {
        let link = build_invite_url("123-456", Some("ws://10.0.0.2:3005/ws"));
        assert!(link.starts_with("lockstep://join?room=123-456"));
        let parsed = parse_invite_url(&link).unwrap();
        assert_eq!(parsed.room_id, "123-456");
        assert_eq!(parsed.server_url.as_deref(), Some("ws://10.0.0.2:3005/ws"));
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(parse_invite_url("room=987-654").unwrap().room_id, "987-654");
        assert_eq!(
            parse_invite_url("https://lockstep.example/join?room=111-222")
                .unwrap()
                .room_id,
            "111-222"
        );
        assert!(parse_invite_url("").is_none());
        assert!(parse_invite_url("lockstep://join?server=x").is_none());
    }
}
