//! Terminal-UI transport: translated operations go straight into the UI
//! program's mailbox.

use crate::backend::{FinishedSignal, RunSummary};
use crate::router::{Handler, Inbound, Message, RouterError};
use crate::timeline::{EntityCompleted, EntityCreated, EntityUpdated, UiOp};
use crate::translator::EventTranslator;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// The four messages a UI program accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum UiSignal {
    Created(EntityCreated),
    Updated(EntityUpdated),
    Completed(EntityCompleted),
    RunFinished(RunSummary),
}

impl From<UiOp> for UiSignal {
    fn from(op: UiOp) -> Self {
        match op {
            UiOp::Created(c) => UiSignal::Created(c),
            UiOp::Updated(u) => UiSignal::Updated(u),
            UiOp::Completed(c) => UiSignal::Completed(c),
        }
    }
}

/// Sending half of a UI program's mailbox.
#[derive(Debug, Clone)]
pub struct ProgramMailbox {
    tx: mpsc::UnboundedSender<UiSignal>,
}

pub fn mailbox() -> (ProgramMailbox, mpsc::UnboundedReceiver<UiSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgramMailbox { tx }, rx)
}

impl ProgramMailbox {
    pub fn send(&self, signal: UiSignal) -> Result<(), RouterError> {
        self.tx
            .send(signal)
            .map_err(|_| RouterError::Handler("ui program has exited".to_string()))
    }
}

/// Run completion is signalled only from here, never from an entity Complete.
impl FinishedSignal for ProgramMailbox {
    fn run_finished(&self, summary: &RunSummary) {
        if self.send(UiSignal::RunFinished(summary.clone())).is_err() {
            debug!(run_id = %summary.run_id, "UI program gone before run finished");
        }
    }
}

/// Router handler translating a session topic into UI signals.
///
/// Router-carried run-finished messages are forwarded too, so the mailbox may
/// also be driven purely over a topic.
pub fn ui_forwarder(mailbox: ProgramMailbox, translator: EventTranslator) -> Handler {
    Arc::new(move |message: &Message| match message.decode()? {
        Inbound::Event(event) => {
            for op in translator.translate(&event)? {
                mailbox.send(op.into())?;
            }
            Ok(())
        }
        Inbound::RunFinished(summary) => mailbox.send(UiSignal::RunFinished(summary)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RunOutcome;
    use crate::events::{Event, EventMetadata};
    use crate::timeline::{EntityId, EntityKind, Timeline};
    use serde_json::Map;

    fn deliver(handler: &Handler, event: &Event) {
        let message = Message::new("tui", event.to_json().unwrap());
        handler(&message).unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UiSignal>) -> Vec<UiSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        signals
    }

    #[test]
    fn test_interrupt_mid_stream_completes_with_partial_text() {
        let (mailbox, mut rx) = mailbox();
        let handler = ui_forwarder(mailbox, EventTranslator::new());
        let meta = EventMetadata::new("run", "turn");
        let id = EntityId::llm_text(meta.id.to_string());

        deliver(&handler, &Event::PartialStart { meta: meta.clone() });
        deliver(
            &handler,
            &Event::Partial {
                meta: meta.clone(),
                delta: "Once".to_string(),
                completion: "Once".to_string(),
            },
        );
        drain(&mut rx);

        deliver(
            &handler,
            &Event::Interrupt {
                meta: meta.clone(),
                text: "Once".to_string(),
            },
        );
        let signals = drain(&mut rx);
        assert_eq!(signals.len(), 2);
        match &signals[0] {
            UiSignal::Completed(c) => {
                assert_eq!(c.id, id);
                assert_eq!(c.result["text"], "Once");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        match &signals[1] {
            UiSignal::Updated(u) => {
                assert_eq!(u.id, id);
                assert_eq!(u.patch.len(), 1);
                assert_eq!(u.patch["streaming"], false);
            }
            other => panic!("expected settle update, got {other:?}"),
        }
    }

    #[test]
    fn test_rapid_mode_switches_are_distinct_paired_entities() {
        let (mailbox, mut rx) = mailbox();
        let handler = ui_forwarder(mailbox, EventTranslator::new());
        for title in ["plan", "act"] {
            deliver(
                &handler,
                &Event::ModeSwitch {
                    meta: EventMetadata::new("run", "turn"),
                    message: title.to_string(),
                    data: Map::new(),
                },
            );
        }

        let signals = drain(&mut rx);
        assert_eq!(signals.len(), 4);
        let mut timeline = Timeline::new();
        let mut ids = Vec::new();
        for pair in signals.chunks(2) {
            let (UiSignal::Created(created), UiSignal::Completed(completed)) = (&pair[0], &pair[1])
            else {
                panic!("expected create/complete pair, got {pair:?}");
            };
            assert_eq!(created.id, completed.id);
            assert_eq!(created.id.kind, EntityKind::Plain);
            timeline.apply(&UiOp::Created(created.clone())).unwrap();
            timeline.apply(&UiOp::Completed(completed.clone())).unwrap();
            ids.push(created.id.clone());
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_run_finished_reaches_the_mailbox() {
        let (mailbox, mut rx) = mailbox();
        let summary = RunSummary {
            run_id: "r".to_string(),
            generation: 3,
            outcome: RunOutcome::Cancelled,
        };
        mailbox.run_finished(&summary);

        let handler = ui_forwarder(mailbox, EventTranslator::new());
        handler(&Message::run_finished("tui", &summary).unwrap()).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                UiSignal::RunFinished(summary.clone()),
                UiSignal::RunFinished(summary)
            ]
        );
    }

    #[test]
    fn test_closed_mailbox_is_a_handler_error() {
        let (mailbox, rx) = mailbox();
        drop(rx);
        let handler = ui_forwarder(mailbox, EventTranslator::new());
        let event = Event::PartialStart {
            meta: EventMetadata::new("run", "turn"),
        };
        let message = Message::new("tui", event.to_json().unwrap());
        assert!(handler(&message).is_err());
    }
}
