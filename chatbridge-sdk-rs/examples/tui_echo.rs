use chatbridge_sdk_rs::{
    backend::{FinishedSignal, ToolLoopBackend},
    echo::EchoToolLoop,
    events::EventSink,
    router::EventRouter,
    translator::EventTranslator,
    tui::{UiSignal, mailbox, ui_forwarder},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv::dotenv().ok();
    chatbridge_sdk_rs::logger::init_logging();

    let prompt = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = if prompt.is_empty() {
        "Hello from the terminal!".to_string()
    } else {
        prompt
    };

    // The finished signal shares the events' topic so it arrives after them.
    let router = EventRouter::spawn();
    let (program, mut inbox) = mailbox();
    router.add_handler("tui", ui_forwarder(program, EventTranslator::new()));

    let sink = Arc::new(router.sink("tui"));
    let backend = ToolLoopBackend::new(
        Arc::new(EchoToolLoop::new(Duration::from_millis(20))),
        vec![sink.clone() as Arc<dyn EventSink>],
        sink as Arc<dyn FinishedSignal>,
    );

    let root = CancellationToken::new();
    let _run = backend.start(&root, &prompt)?;

    while let Some(signal) = inbox.recv().await {
        match signal {
            UiSignal::Created(c) => println!("+ {} {}", c.id, serde_json::Value::Object(c.props)),
            UiSignal::Updated(u) => println!("~ {} {}", u.id, serde_json::Value::Object(u.patch)),
            UiSignal::Completed(c) => {
                println!("= {} {}", c.id, serde_json::Value::Object(c.result))
            }
            UiSignal::RunFinished(summary) => {
                println!("run {} finished: {:?}", summary.run_id, summary.outcome);
                break;
            }
        }
    }

    router.close();
    Ok(())
}
