//! Interactive loop of the `remexec` client.

use anyhow::Result;
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::warn;

use crate::client::{Client, PutOutcome, RunReply};
use crate::command::{Command, Verb};
use crate::protocol_core::content_end;

pub const PROMPT: &str = "Enter a command: ";
const RESPONSE_HEADER: &str = "--- Response ---";

/// Write `content` to `out`, pausing for Enter after every `page_lines`
/// newlines. Content ends at the first zero byte.
pub async fn paginate<R, W>(content: &[u8], page_lines: usize, input: &mut R, out: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let content = &content[..content_end(content)];
    let mut shown = 0;
    let mut paging = true;
    let mut rest = content;
    while !rest.is_empty() {
        let line_end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        let (line, tail) = rest.split_at(line_end);
        out.write_all(line).await?;
        rest = tail;
        if line.ends_with(b"\n") {
            shown += 1;
            if paging && shown % page_lines == 0 && !rest.is_empty() {
                out.write_all(b"-- Press Enter for more --").await?;
                out.flush().await?;
                let mut ack = String::new();
                if input.read_line(&mut ack).await? == 0 {
                    // No operator left to page for; print the rest straight through
                    out.write_all(b"\n").await?;
                    paging = false;
                }
            }
        }
    }
    out.flush().await?;
    Ok(())
}

fn print_response(body: &[u8]) {
    let text = String::from_utf8_lossy(&body[..content_end(body)]);
    println!("{RESPONSE_HEADER}");
    print!("{text}");
    if !text.ends_with('\n') {
        println!();
    }
}

fn print_put(outcome: PutOutcome) {
    match outcome {
        PutOutcome::NotSent(message) => print!("{message}"),
        PutOutcome::Refused { info, verdict } => {
            println!("{RESPONSE_HEADER}");
            print!("{info}");
            println!("{verdict}");
        }
        PutOutcome::Sent {
            info,
            status,
            truncated,
        } => {
            println!("{RESPONSE_HEADER}");
            print!("{info}");
            for name in truncated {
                println!("warning: {name} was cut at the file block size");
            }
            print!("{status}");
            if !status.ends_with('\n') {
                println!();
            }
        }
    }
}

/// Runs one fire-and-forget command and prints its reply when it arrives.
async fn background(client: Arc<Client>, command: Command) {
    let result = match command.verb {
        Verb::Run => client.run(&command).await.map(|reply| match reply {
            RunReply::Output(output) => print_response(&output),
            RunReply::Saved(path) => println!("Output saved to {}", path.display()),
            RunReply::FileExists(_) => println!("File exists!"),
        }),
        _ => client.call(&command.line).await.map(|reply| print_response(&reply)),
    };
    if let Err(err) = result {
        eprintln!("{}: {:#}", command.verb, err);
    }
}

/// Read commands from `input` until `quit` or end of input.
pub async fn run<R>(client: Arc<Client>, mut input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut tasks: JoinSet<()> = JoinSet::new();
    let page_lines = client.config().settings.page_lines;
    let mut line = String::new();

    loop {
        while let Some(done) = tasks.try_join_next() {
            if let Err(err) = done {
                warn!(error = %err, "command task failed");
            }
        }

        print!("{PROMPT}");
        std::io::stdout().flush()?;
        line.clear();
        if input.read_line(&mut line).await? == 0 {
            println!();
            break;
        }
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        if let Err(message) = command.validate() {
            print!("{message}");
            continue;
        }

        match command.verb {
            Verb::Quit => break,
            Verb::Put => match client.put(&command).await {
                Ok(outcome) => print_put(outcome),
                Err(err) => {
                    eprintln!("put: {err:#}");
                    break;
                }
            },
            Verb::Get => match client.call(&command.line).await {
                Ok(reply) => {
                    println!("{RESPONSE_HEADER}");
                    let mut stdout = tokio::io::stdout();
                    paginate(&reply, page_lines, &mut input, &mut stdout).await?;
                    if !reply.ends_with(b"\n") {
                        println!();
                    }
                }
                Err(err) => {
                    eprintln!("get: {err:#}");
                    break;
                }
            },
            _ => {
                tasks.spawn(background(Arc::clone(&client), command));
            }
        }
    }

    // Replies to earlier commands arrive before the quit acknowledgement
    let quit = client.quit().await;
    while tasks.join_next().await.is_some() {}
    quit
}
