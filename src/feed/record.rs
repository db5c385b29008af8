use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::error::FeedError;

/// One entry of the task history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Remote task id, only used in log messages.
    pub id: String,
    /// Creation time in whole seconds since the epoch. Not unique.
    pub created: i64,
    /// Asset download locations, in feed order.
    pub assets: Vec<String>,
    /// Prompt text. Edits and variations have none.
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskPage {
    /// Required: a body without it is an error response, not the end of
    /// history.
    data: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default)]
    id: String,
    #[serde(deserialize_with = "deserialize_created")]
    created: i64,
    #[serde(default)]
    generations: Option<Generations>,
    #[serde(default)]
    prompt: Option<PromptEnvelope>,
}

#[derive(Debug, Deserialize)]
struct Generations {
    #[serde(default)]
    data: Vec<GenerationEntry>,
}

#[derive(Debug, Deserialize)]
struct GenerationEntry {
    generation: Generation,
}

#[derive(Debug, Deserialize)]
struct Generation {
    image_path: String,
}

#[derive(Debug, Deserialize)]
struct PromptEnvelope {
    #[serde(default)]
    prompt: Option<PromptBody>,
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    #[serde(default)]
    caption: Option<String>,
}

/// `created` shows up as an integer, a float, or a numeric string depending
/// on the endpoint version. Fractions are truncated.
fn deserialize_created<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Value::deserialize(deserializer)?;
    let seconds = match &value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    };
    seconds.ok_or_else(|| D::Error::custom(format!("invalid creation time: {value}")))
}

impl From<RawTask> for Record {
    fn from(raw: RawTask) -> Self {
        let assets = raw
            .generations
            .map(|g| {
                g.data
                    .into_iter()
                    .map(|entry| entry.generation.image_path)
                    .collect()
            })
            .unwrap_or_default();
        let caption = raw
            .prompt
            .and_then(|p| p.prompt)
            .and_then(|body| body.caption);
        Self {
            id: raw.id,
            created: raw.created,
            assets,
            caption,
        }
    }
}

/// Parse one history page response body.
pub fn parse_page(body: &str) -> Result<Vec<Record>, FeedError> {
    let page: TaskPage = serde_json::from_str(body)?;
    Ok(page.data.into_iter().map(Record::from).collect())
}
