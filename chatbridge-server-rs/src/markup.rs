use chatbridge_sdk_rs::turn::{Block, Turn};
use minijinja::{context, Environment, UndefinedBehavior, Value};
use serde::Serialize;

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");
const CHAT_TEMPLATE: &str = include_str!("../templates/chat.html");

#[derive(Debug, thiserror::Error)]
pub enum MarkupError {
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("failed to serialize turn state: {0}")]
    State(#[from] serde_json::Error),
}

/// Templates end in `.html`, so their output is auto-escaped.
fn environment() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("index.html", INDEX_TEMPLATE)?;
    env.add_template("chat.html", CHAT_TEMPLATE)?;
    Ok(env)
}

fn render(name: &str, ctx: Value) -> Result<String, MarkupError> {
    Ok(environment()?.get_template(name)?.render(ctx)?)
}

pub fn page_url(client_id: &str) -> String {
    format!("/?client_id={}", urlencoding::encode(client_id))
}

#[derive(Serialize)]
struct TranscriptEntry<'a> {
    role: &'static str,
    text: &'a str,
}

fn transcript(turn: &Turn) -> Vec<TranscriptEntry<'_>> {
    turn.blocks
        .iter()
        .filter_map(|block| match block {
            Block::User { text } => Some(TranscriptEntry { role: "user", text }),
            Block::Llm { text } => Some(TranscriptEntry {
                role: "assistant",
                text,
            }),
            _ => None,
        })
        .collect()
}

/// The conversation container: the timeline, the SSE subscription and the
/// message form, with the stored turn embedded for the client script.
pub fn chat_container(client_id: &str, turn: &Turn) -> Result<String, MarkupError> {
    // `</` would end the script element early.
    let state = serde_json::to_string(turn)?.replace("</", "<\\/");
    render(
        "chat.html",
        context! {
            client_id,
            encoded_id => urlencoding::encode(client_id),
            transcript => transcript(turn),
            turn_state => Value::from_safe_string(state),
        },
    )
}

/// The landing page, wrapping an already rendered container if there is one.
pub fn index_page(container: Option<String>) -> Result<String, MarkupError> {
    render(
        "index.html",
        context! {
            container => container.map(Value::from_safe_string),
        },
    )
}
