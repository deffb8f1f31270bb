//! Wire and in-memory types for the board API and push channel

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Ids arrive as JSON strings or integers depending on the server; both
/// are held as strings on the client.
fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Str(s) => s,
        RawId::Int(n) => n.to_string(),
    })
}

/// Access/refresh credential pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// Access token, sent as the bearer credential
    #[serde(rename = "token")]
    pub access_token: String,
    /// Refresh token, exchanged at `/auth/refresh`
    pub refresh_token: String,
}

/// Card priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        f.write_str(s)
    }
}

/// A unit of work belonging to exactly one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(deserialize_with = "de_id")]
    pub column_id: String,
    #[serde(deserialize_with = "de_id")]
    pub board_id: String,
}

/// An ordered bucket of cards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cards: Vec<Card>,
}

/// A named collection of ordered columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Board {
    /// Locate a card as `(column index, card index)`
    pub fn position_of(&self, card_id: &str) -> Option<(usize, usize)> {
        self.columns.iter().enumerate().find_map(|(ci, column)| {
            column
                .cards
                .iter()
                .position(|c| c.id == card_id)
                .map(|pos| (ci, pos))
        })
    }

    /// Find a card anywhere on the board
    pub fn card(&self, card_id: &str) -> Option<&Card> {
        self.position_of(card_id)
            .map(|(ci, pos)| &self.columns[ci].cards[pos])
    }

    pub fn column_index(&self, column_id: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.id == column_id)
    }

    /// Total number of cards across all columns
    pub fn card_count(&self) -> usize {
        self.columns.iter().map(|c| c.cards.len()).sum()
    }
}

/// Response from `GET /boards`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardList {
    #[serde(default)]
    pub boards: Vec<Board>,
}

/// Request body for `POST /boards`
#[derive(Debug, Clone, Serialize)]
pub struct NewBoard {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Request body for `POST /cards`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCard {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    pub column_id: String,
    pub board_id: String,
}

/// Change made by another client, delivered over the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    CardCreate(Card),
    CardUpdate(Card),
    CardDelete { card_id: String },
}

/// Raw push frame: `{type, payload}`
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletePayload {
    #[serde(deserialize_with = "de_id")]
    card_id: String,
}

impl RemoteEvent {
    /// Decode a text frame from the push channel.
    ///
    /// Returns `Ok(None)` for well-formed frames whose tag is not one of the
    /// card events; those are ignored by the channel.
    pub fn decode(text: &str) -> serde_json::Result<Option<Self>> {
        let frame: Frame = serde_json::from_str(text)?;
        let event = match frame.kind.as_str() {
            "cardCreate" => RemoteEvent::CardCreate(serde_json::from_value(frame.payload)?),
            "cardUpdate" => RemoteEvent::CardUpdate(serde_json::from_value(frame.payload)?),
            "cardDelete" => {
                let payload: DeletePayload = serde_json::from_value(frame.payload)?;
                RemoteEvent::CardDelete {
                    card_id: payload.card_id,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Id of the card the event concerns
    pub fn card_id(&self) -> &str {
        match self {
            RemoteEvent::CardCreate(card) | RemoteEvent::CardUpdate(card) => &card.id,
            RemoteEvent::CardDelete { card_id } => card_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RemoteEvent::CardCreate(_) => "cardCreate",
            RemoteEvent::CardUpdate(_) => "cardUpdate",
            RemoteEvent::CardDelete { .. } => "cardDelete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_decodes_numeric_ids() {
        let json = r#"{
            "id": 7,
            "name": "Roadmap",
            "columns": [
                {"id": 1, "name": "Todo", "cards": [
                    {"id": 11, "title": "Write docs", "priority": "high", "columnId": 1, "boardId": 7}
                ]},
                {"id": "2", "name": "Done"}
            ]
        }"#;

        let board: Board = serde_json::from_str(json).unwrap();
        assert_eq!(board.id, "7");
        assert_eq!(board.description, None);
        assert_eq!(board.columns[1].id, "2");
        assert!(board.columns[1].cards.is_empty());

        let card = board.card("11").unwrap();
        assert_eq!(card.column_id, "1");
        assert_eq!(card.priority, Priority::High);
        assert_eq!(board.position_of("11"), Some((0, 0)));
        assert_eq!(board.card_count(), 1);
    }

    #[test]
    fn test_token_pair_uses_durable_key_names() {
        let pair = TokenPair {
            access_token: "a".into(),
            refresh_token: "r".into(),
        };
        let value = serde_json::to_value(&pair).unwrap();
        assert_eq!(value["token"], "a");
        assert_eq!(value["refreshToken"], "r");
    }

    #[test]
    fn test_decode_card_events() {
        let update = r#"{"type":"cardUpdate","payload":{"id":"c1","title":"T","priority":"low","columnId":"colB","boardId":"b1"}}"#;
        match RemoteEvent::decode(update).unwrap() {
            Some(RemoteEvent::CardUpdate(card)) => {
                assert_eq!(card.id, "c1");
                assert_eq!(card.column_id, "colB");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let delete = r#"{"type":"cardDelete","payload":{"cardId":"c9"}}"#;
        assert_eq!(
            RemoteEvent::decode(delete).unwrap(),
            Some(RemoteEvent::CardDelete {
                card_id: "c9".into()
            })
        );
    }

    #[test]
    fn test_decode_unknown_tag_is_ignored() {
        let frame = r#"{"type":"board_updated","board_id":3}"#;
        assert_eq!(RemoteEvent::decode(frame).unwrap(), None);
    }

    #[test]
    fn test_decode_malformed_frames_fail() {
        assert!(RemoteEvent::decode("not json").is_err());
        assert!(RemoteEvent::decode(r#"{"type":"cardDelete","payload":{}}"#).is_err());
        assert!(RemoteEvent::decode(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
