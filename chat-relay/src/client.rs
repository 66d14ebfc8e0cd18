use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, framer::LineFramer};

const LEAVE_COMMAND: &str = "/leave";
const READ_CHUNK: usize = 1024;

/// Line-for-line terminal client: stdin goes to the relay, relay lines go to
/// stdout unchanged.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_line(&mut writer, &args.name)
        .await
        .context("failed to send name")?;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut stdout).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    Ok(stream.into_split())
}

/// Both sources are read with `read`, which loses nothing when the other
/// branch wins; partial lines wait in their framers.
async fn run_client_loop<R, W, I, O>(
    reader: &mut R,
    writer: &mut W,
    input: &mut I,
    output: &mut O,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut relay_lines = LineFramer::new();
    let mut input_lines = LineFramer::new();
    let mut relay_chunk = [0u8; READ_CHUNK];
    let mut input_chunk = [0u8; READ_CHUNK];

    loop {
        select! {
            bytes_read = reader.read(&mut relay_chunk) => {
                if !handle_relay_chunk(bytes_read, &relay_chunk, &mut relay_lines, output).await? {
                    break;
                }
            }
            bytes_read = input.read(&mut input_chunk) => {
                if !handle_stdin_chunk(bytes_read, &input_chunk, &mut input_lines, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

/// Prints every completed relay line. When the relay closes the connection a
/// trailing partial line is still printed.
async fn handle_relay_chunk<O>(
    bytes_read: io::Result<usize>,
    chunk: &[u8],
    lines: &mut LineFramer,
    output: &mut O,
) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    let bytes_read = bytes_read.context("failed to read from relay")?;
    if bytes_read == 0 {
        if let Some(tail) = lines.take_pending() {
            write_output(output, &tail).await?;
        }
        info!("relay closed the connection");
        return Ok(false);
    }

    for line in lines.feed(&chunk[..bytes_read]) {
        write_output(output, &line).await?;
    }
    Ok(true)
}

/// Forwards completed stdin lines. Stops after `/leave`, or at end of input
/// once any unterminated last line has been sent.
async fn handle_stdin_chunk<W>(
    bytes_read: io::Result<usize>,
    chunk: &[u8],
    lines: &mut LineFramer,
    writer: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let bytes_read = bytes_read.context("failed to read stdin")?;
    let input: Vec<String> = if bytes_read == 0 {
        lines.take_pending().into_iter().collect()
    } else {
        lines.feed(&chunk[..bytes_read])
    };

    for text in input {
        send_line(writer, &text)
            .await
            .context("failed to send line to relay")?;
        if text == LEAVE_COMMAND {
            return Ok(false);
        }
    }

    Ok(bytes_read > 0)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn send_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_output<O>(output: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
