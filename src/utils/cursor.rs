use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// URL-safe base64 of `<rfc3339 created_at>|<uuid>` from the last row of a page.
pub fn encode(created_at: DateTime<Utc>, id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{}", created_at.to_rfc3339(), id))
}

/// Errors are plain messages; callers wrap them for the client.
pub fn decode(cursor: &str) -> Result<(DateTime<Utc>, Uuid), String> {
    let raw = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| format!("cursor is not base64: {}", e))?;
    let text = std::str::from_utf8(&raw).map_err(|_| "cursor is not utf-8".to_string())?;

    let (created_at, id) = text
        .split_once('|')
        .ok_or_else(|| "cursor has no row id".to_string())?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| format!("cursor timestamp: {}", e))?
        .with_timezone(&Utc);
    let id = Uuid::parse_str(id).map_err(|e| format!("cursor row id: {}", e))?;

    Ok((created_at, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_keeps_sub_second_precision() {
        let created_at = Utc::now();
        let id = Uuid::new_v4();
        assert_eq!(decode(&encode(created_at, id)).unwrap(), (created_at, id));
    }

    #[test]
    fn test_garbage_cursor_is_rejected() {
        assert!(decode("not a cursor!").is_err());
        assert!(decode(&URL_SAFE_NO_PAD.encode("2024-01-01T00:00:00Z")).is_err());
        assert!(decode(&URL_SAFE_NO_PAD.encode("yesterday|not-a-uuid")).is_err());
    }
}
