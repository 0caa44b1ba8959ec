//! rasterd-worker: owns one PDFium instance and answers render requests on stdio.
//!
//! stdout carries the line protocol and nothing else; diagnostics go to stderr,
//! which the parent forwards into its own log.

mod engine;

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    process,
    time::Instant,
};

use clap::Parser;
use rasterd::worker::protocol::{
    FailureKind, Operation, Outcome, WorkerEvent, WorkerReply, WorkerRequest,
};
use serde::Serialize;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use engine::Engine;

#[derive(Debug, Parser)]
#[command(
    name = "rasterd-worker",
    version,
    about = "PDFium render worker driven by rasterd over stdin/stdout"
)]
struct WorkerArgs {
    /// PDFium shared library, or the directory that contains it.
    #[arg(long = "pdfium-library", env = "RASTERD_PDFIUM_LIBRARY", value_name = "PATH")]
    pdfium_library: Option<PathBuf>,
}

fn main() {
    let args = WorkerArgs::parse();
    init_tracing();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    let pdfium = match engine::bind(args.pdfium_library.as_deref()) {
        Ok(pdfium) => pdfium,
        Err(err) => {
            let message = format!("failed to load pdfium: {err}");
            error!(target = "rasterd_worker", op = "startup", error = %err, "PDFium unavailable");
            if let Err(err) = write_line(&mut out, &WorkerEvent::StartupFailed { message }) {
                error!(target = "rasterd_worker", error = %err, "Failed to report startup failure");
            }
            process::exit(1);
        }
    };

    let pid = process::id();
    if let Err(err) = write_line(&mut out, &WorkerEvent::Ready { pid }) {
        error!(target = "rasterd_worker", error = %err, "Failed to announce readiness");
        process::exit(1);
    }
    info!(target = "rasterd_worker", op = "startup", pid, "Worker ready");

    let mut engine = Engine::new(&pdfium);
    let stdin = io::stdin();
    match serve(stdin.lock(), &mut out, |op| engine.handle(op)) {
        Ok(()) => info!(target = "rasterd_worker", "Input closed, exiting"),
        Err(err) => {
            error!(target = "rasterd_worker", error = %err, "Protocol stream failed");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // A second subscriber can only be installed in tests; ignoring that is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .compact()
        .try_init();
}

/// Answer every request line on `input` until it closes.
///
/// Lines that are not valid requests but still carry an `id` get an
/// `invalid_request` failure so the caller is not left waiting.
fn serve<R, W, F>(input: R, out: &mut W, mut handle: F) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    F: FnMut(Operation) -> Outcome,
{
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest { id, op }) => {
                let started = Instant::now();
                let operation = op.name();
                let outcome = handle(op);
                debug!(
                    target = "rasterd_worker",
                    id,
                    op = operation,
                    result = outcome.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request handled"
                );
                WorkerReply { id, outcome }
            }
            Err(err) => match request_id(&line) {
                Some(id) => WorkerReply {
                    id,
                    outcome: Outcome::failed(
                        FailureKind::InvalidRequest,
                        format!("malformed request: {err}"),
                    ),
                },
                None => {
                    warn!(target = "rasterd_worker", error = %err, "Dropping unreadable line");
                    continue;
                }
            },
        };

        write_line(out, &reply)?;
    }
    Ok(())
}

fn request_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}

fn write_line<W: Write, T: Serialize>(out: &mut W, message: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *out, message)?;
    out.write_all(b"\n")?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use rasterd::worker::protocol::decode_payload;

    use super::*;

    fn run(input: &str, handle: impl FnMut(Operation) -> Outcome) -> Vec<WorkerReply> {
        let mut out = Vec::new();
        serve(input.as_bytes(), &mut out, handle).expect("serve");
        String::from_utf8(out)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("reply line"))
            .collect()
    }

    #[test]
    fn answers_each_request_with_its_id() {
        let input = concat!(
            r#"{"id":1,"op":{"type":"open_document","document":"JVBERg=="}}"#,
            "\n\n",
            r#"{"id":2,"op":{"type":"close_document","document":1}}"#,
            "\n",
        );
        let replies = run(input, |op| match op {
            Operation::OpenDocument { document } => {
                assert_eq!(decode_payload(&document).expect("base64"), b"%PDF");
                Outcome::DocumentOpened {
                    document: 1,
                    page_count: 2,
                }
            }
            _ => Outcome::DocumentClosed,
        });

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, 1);
        assert_eq!(
            replies[0].outcome,
            Outcome::DocumentOpened {
                document: 1,
                page_count: 2
            }
        );
        assert_eq!(replies[1].id, 2);
        assert_eq!(replies[1].outcome, Outcome::DocumentClosed);
    }

    #[test]
    fn malformed_requests_fail_without_stalling() {
        let input = concat!(
            r#"{"id":9,"op":{"type":"explode"}}"#,
            "\n",
            "not json at all\n",
            r#"{"id":10,"op":{"type":"close_document","document":4}}"#,
            "\n",
        );
        let replies = run(input, |_| Outcome::DocumentClosed);

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, 9);
        assert!(matches!(
            replies[0].outcome,
            Outcome::Failed {
                kind: FailureKind::InvalidRequest,
                ..
            }
        ));
        assert_eq!(replies[1].id, 10);
    }

    #[test]
    fn ready_event_is_one_line() {
        let mut out = Vec::new();
        write_line(&mut out, &WorkerEvent::Ready { pid: 12 }).expect("write");
        assert_eq!(out, b"{\"event\":\"ready\",\"pid\":12}\n");
    }
}
