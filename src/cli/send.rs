//! One-shot `send` command: submit a single prompt and stream the reply to
//! stdout.

use std::error::Error;
use std::io;
use std::ops::ControlFlow;

use tokio::sync::mpsc;

use crate::cli::printer::{OpenLine, StreamPrinter};
use crate::core::chat::ChatId;
use crate::core::message::Attachments;
use crate::core::requests::RequestOutcome;
use crate::core::session::{Session, SessionDriver};

#[derive(Default)]
struct WaitForReply {
    outcome: Option<RequestOutcome>,
}

impl SessionDriver for WaitForReply {
    type Command = ();

    fn on_command(&mut self, _session: &mut Session, _command: ()) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn on_outcome(
        &mut self,
        _session: &Session,
        _chat: &ChatId,
        outcome: &RequestOutcome,
    ) -> ControlFlow<()> {
        self.outcome = Some(outcome.clone());
        ControlFlow::Break(())
    }
}

pub async fn run_send(
    mut session: Session,
    prompt: &str,
    mcp: bool,
    attachments: Attachments,
) -> Result<(), Box<dyn Error>> {
    let open_line = OpenLine::default();
    session.subscribe(Box::new(
        StreamPrinter::new(io::stdout(), open_line.clone()).without_headers(),
    ));
    session.new_chat();
    if mcp {
        session.set_mcp_mode(true);
    }
    session.submit(prompt, attachments)?;

    // The sender stays alive so the loop only ends with the reply.
    let (_tx, mut rx) = mpsc::unbounded_channel();
    let mut driver = WaitForReply::default();
    session.run(&mut rx, &mut driver).await;
    if open_line.take() {
        println!();
    }

    match driver.outcome {
        Some(RequestOutcome::Completed) => Ok(()),
        Some(outcome) => Err(format!("Request did not complete: {outcome:?}").into()),
        None => Err("Stream ended without a result".into()),
    }
}
