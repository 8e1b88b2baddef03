use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    envelope::{AuthAction, Body, Envelope, SERVER_SENDER, decode, read_frame, write_envelope},
    storage::{DiskFileStore, FileStore},
    transfer::{PendingTransfers, Progress, read_chunks},
};

/// What a line typed by the user turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send(Envelope),
    SendFile(PathBuf),
    Quit,
    Nothing,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_credentials(&mut writer, &args).await?;

    let mut state = ClientState {
        downloads: DiskFileStore::new(&args.downloads_dir),
        incoming: PendingTransfers::default(),
        chunk_size: args.chunk_size,
    };
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut lines = Lines::default();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut lines, &mut state).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Partial lines from the server and from stdin, kept across `select!` passes.
#[derive(Default)]
struct Lines {
    server: String,
    input: String,
}

struct ClientState {
    downloads: DiskFileStore,
    incoming: PendingTransfers,
    chunk_size: usize,
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn send_credentials(writer: &mut OwnedWriteHalf, args: &ClientArgs) -> Result<()> {
    let action = if args.register {
        AuthAction::Register
    } else {
        AuthAction::Login
    };
    write_envelope(
        writer,
        &Envelope::new(Body::Auth {
            action,
            username: args.username.clone(),
            password: args.password.clone(),
        }),
    )
    .await?;
    Ok(())
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    lines: &mut Lines,
    state: &mut ClientState,
) -> Result<()> {
    loop {
        // Both reads append, so a line interrupted by the other side is
        // picked up again on the next pass.
        select! {
            frame = read_frame(reader, &mut lines.server) => {
                let keep_going = handle_server_frame(frame, &lines.server, state).await?;
                lines.server.clear();
                if !keep_going {
                    break;
                }
            }
            bytes_read = stdin.read_line(&mut lines.input) => {
                let keep_going = handle_stdin_input(bytes_read, &lines.input, writer, state).await?;
                lines.input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: io::Result<bool>,
    line: &str,
    state: &mut ClientState,
) -> Result<bool> {
    if !frame? {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    }
    let message = match decode(line) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable message from server");
            return Ok(true);
        }
    };

    if let Body::File(chunk) = &message.body {
        match state.incoming.accept(&message.sender, chunk) {
            Ok(Progress::Complete(file)) => {
                let path = state
                    .downloads
                    .save_assembled(&file.bytes, &file.filename, &message.room)
                    .await?;
                write_stdout(&format!(
                    "*** received {} from {} ({})",
                    file.filename,
                    file.sender,
                    path.display()
                ))
                .await?;
            }
            Ok(Progress::Pending { .. }) => {}
            Err(err) => warn!(error = %err, "dropping file chunk"),
        }
        return Ok(true);
    }

    if let Some(line) = render(&message) {
        if line.starts_with("!!! ") {
            write_stderr(&line).await?;
        } else {
            write_stdout(&line).await?;
        }
    }
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
    state: &ClientState,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    match parse_input(input) {
        Input::Nothing => {}
        Input::Quit => {
            write_envelope(writer, &Envelope::command("quit")).await?;
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Input::Send(envelope) => write_envelope(writer, &envelope).await?,
        Input::SendFile(path) => match read_chunks(&path, state.chunk_size).await {
            Ok(chunks) => {
                let total = chunks.len();
                for chunk in chunks {
                    write_envelope(writer, &Envelope::new(Body::File(chunk))).await?;
                }
                write_stdout(&format!("*** sent {} in {total} chunks", path.display())).await?;
            }
            Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
        },
    }
    Ok(true)
}

/// Maps a line of user input onto a request. Lines starting with `/` are
/// commands; anything else is room text.
pub fn parse_input(line: &str) -> Input {
    let text = line.trim_end();
    if text.trim().is_empty() {
        return Input::Nothing;
    }

    let Some(command) = text.strip_prefix('/') else {
        return Input::Send(Envelope::new(Body::Text {
            content: text.to_string(),
        }));
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match name.to_ascii_lowercase().as_str() {
        "quit" => Input::Quit,
        "send" if !rest.is_empty() => Input::SendFile(PathBuf::from(rest)),
        "create" | "join" => Input::Send(Envelope::room_command(name, rest)),
        _ if rest.is_empty() => Input::Send(Envelope::command(name)),
        _ => Input::Send(Envelope::command(format!("{name} {rest}"))),
    }
}

/// Formats a message from the relay for the terminal.
pub fn render(message: &Envelope) -> Option<String> {
    let time = message.timestamp.format("%H:%M:%S");
    match &message.body {
        Body::Text { content } if message.sender == SERVER_SENDER => {
            Some(format!("[{time}] {content}"))
        }
        Body::Text { content } => Some(format!("[{}] {}: {content}", message.room, message.sender)),
        Body::Command { content } => match content.strip_prefix("ERROR: ") {
            Some(error) => Some(format!("!!! {error}")),
            None => Some(format!(
                "*** {}",
                content.strip_prefix("SUCCESS: ").unwrap_or(content)
            )),
        },
        Body::Direct { recipient, content } => {
            Some(format!("[DM] {} -> {recipient}: {content}", message.sender))
        }
        Body::Encrypted { recipient, content } => Some(format!(
            "[encrypted] {} -> {recipient}: {content}",
            message.sender
        )),
        Body::Auth { .. } | Body::Status { .. } | Body::File(_) => None,
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
