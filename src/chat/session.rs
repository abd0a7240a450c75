//! Interactive question loop
//!
//! Drives a [`ChatHandler`] from input lines until the user quits, input
//! ends or an interrupt arrives. An interrupt during generation sets the
//! stop flag so the model stops at its next token.

use std::future::Future;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat::handler::{ChatHandler, ChatReply};

/// Line printed above and below every answer
pub const SEPARATOR: &str = "------------------------------";

const QUIT_COMMAND: &str = "q";

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Quit,
    EndOfInput,
    Interrupted,
}

/// Read stdin lines on a dedicated thread
///
/// The blocking read stays off the async runtime, so an interrupted session
/// never waits for the user to press Enter.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to read input: {}", e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to start input reader: {}", e);
    }
    rx
}

/// Run the question loop, writing prompts and answers to `out`
pub async fn run_session<W, I>(
    handler: &ChatHandler,
    lines: &mut mpsc::Receiver<String>,
    interrupt: I,
    out: &mut W,
) -> io::Result<SessionEnd>
where
    W: Write,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);

    loop {
        write!(out, "\nQuestion (q to quit): ")?;
        out.flush()?;

        let line = tokio::select! {
            line = lines.recv() => line,
            _ = &mut interrupt => return Ok(SessionEnd::Interrupted),
        };
        let Some(question) = line else {
            return Ok(SessionEnd::EndOfInput);
        };
        if question.trim().eq_ignore_ascii_case(QUIT_COMMAND) {
            return Ok(SessionEnd::Quit);
        }

        writeln!(out, "Generating answer...")?;
        let stop = Arc::new(AtomicBool::new(false));
        let reply = tokio::select! {
            reply = handler.on_message_with_stop(&question, Arc::clone(&stop)) => reply,
            _ = &mut interrupt => {
                stop.store(true, Ordering::SeqCst);
                tracing::info!("Interrupted, stopping generation");
                return Ok(SessionEnd::Interrupted);
            }
        };

        match &reply {
            ChatReply::Answer { text, elapsed } => {
                writeln!(out, "{}", SEPARATOR)?;
                writeln!(out, "{}", text)?;
                writeln!(out, "{}", SEPARATOR)?;
                writeln!(out, "Answered in {:.2}s", elapsed.as_secs_f64())?;
            }
            _ => writeln!(out, "{}", reply.message())?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::handler::INVALID_INPUT_MSG;
    use crate::inference::testing::FakeModel;
    use crate::inference::{LanguageModel, ModelHandle, ResponseGenerator};
    use crate::system::Summary;
    use crate::types::{Device, GenerationConfig, SpecialTokens};
    use std::time::{Duration, Instant};

    fn handler_for(model: Arc<FakeModel>) -> ChatHandler {
        let handle = ModelHandle {
            model: model as Arc<dyn LanguageModel>,
            tokens: SpecialTokens { eos: 2, pad: Some(2) },
            device: Device::Cpu,
            model_name: "fake".to_string(),
        };
        ChatHandler::new(ResponseGenerator::with_config(
            &handle,
            GenerationConfig::default(),
            Arc::new(Summary::response_time()),
        ))
    }

    async fn input(lines: &[&str]) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.send(line.to_string()).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_answers_until_quit() {
        let handler = handler_for(Arc::new(FakeModel::new("Sunny.")));
        let mut lines = input(&["How is the weather?", "<>", "Q", "never read"]).await;
        let mut out = Vec::new();

        let end = run_session(&handler, &mut lines, std::future::pending::<()>(), &mut out)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Quit);

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("{}\nSunny.\n{}\n", SEPARATOR, SEPARATOR)));
        assert!(text.contains("Answered in "));
        assert!(text.contains(INVALID_INPUT_MSG));
        assert_eq!(lines.recv().await.as_deref(), Some("never read"));
    }

    #[tokio::test]
    async fn test_closed_input_ends_session() {
        let handler = handler_for(Arc::new(FakeModel::new("unused")));
        let mut lines = input(&[]).await;
        let mut out = Vec::new();

        let end = run_session(&handler, &mut lines, std::future::pending::<()>(), &mut out)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::EndOfInput);
    }

    #[tokio::test]
    async fn test_interrupt_while_waiting_for_input() {
        let handler = handler_for(Arc::new(FakeModel::new("unused")));
        // Sender kept alive: no line ever arrives
        let (_tx, mut lines) = mpsc::channel::<String>(1);
        let mut out = Vec::new();
        let started = Instant::now();

        let interrupt = tokio::time::sleep(Duration::from_millis(50));
        let end = run_session(&handler, &mut lines, interrupt, &mut out)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_interrupt_stops_running_generation() {
        let model = Arc::new(FakeModel::new("late").with_delay(Duration::from_secs(5)));
        let handler = handler_for(model.clone());
        let mut lines = input(&["hello"]).await;
        let mut out = Vec::new();
        let started = Instant::now();

        let interrupt = tokio::time::sleep(Duration::from_millis(50));
        let end = run_session(&handler, &mut lines, interrupt, &mut out)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(1));

        // The blocking generation sees the stop flag and gives up
        let deadline = Instant::now() + Duration::from_secs(1);
        while model.cancellations() == 0 {
            assert!(Instant::now() < deadline, "generation kept running");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
