// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use udpmsg::UdpMessenger;
use udpmsg::messenger::errors::{BindError, Coded as _, ErrorCode, ReceiveError, SendError};
use udpmsg::messenger::{DEFAULT_BUFFER_SIZE, PacketMap};
use udpmsg_platform_std::StdPlatform;

/// Send and receive udpmsg datagrams over the host's UDP sockets
#[derive(Parser, Debug)]
pub struct CliArgs {
    /// Local port to bind (0 picks any free port)
    #[arg(long, default_value_t = 0)]
    pub port: u16,
    /// Buffer size hint passed to the stack when binding
    #[arg(long = "buffer-size", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    /// Local address to bind
    #[arg(long = "bind-address", default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub bind_address: Ipv4Addr,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message, split into chunks if it is too long for one datagram
    Send {
        /// Destination address
        ip: Ipv4Addr,
        /// The message to send
        message: String,
        /// Destination port (defaults to `--port`, for symmetric peers; one of the two is needed)
        #[arg(long = "to-port")]
        to_port: Option<u16>,
    },
    /// Print datagrams as they arrive, one line each
    Listen {
        /// How long a single wait for a datagram lasts before starting over
        #[arg(long = "timeout-ms", default_value_t = 1000)]
        timeout_ms: u64,
        /// Sleep between polls once the receive has stopped busy-spinning
        #[arg(long = "poll-ms", default_value_t = 50)]
        poll_ms: u64,
        /// Stop after this many datagrams
        #[arg(long)]
        count: Option<usize>,
        /// Stop after this long, interrupting any wait in progress
        #[arg(long = "for-ms")]
        for_ms: Option<u64>,
    },
}

/// Run the command described by `cli_args`, writing received datagrams to stdout.
pub fn run(cli_args: CliArgs) -> Result<()> {
    run_to(cli_args, &mut std::io::stdout().lock())
}

/// Run the command described by `cli_args`, writing received datagrams to `out`.
pub fn run_to(cli_args: CliArgs, out: &mut dyn Write) -> Result<()> {
    let CliArgs {
        port,
        buffer_size,
        bind_address,
        command,
    } = cli_args;
    match command {
        Command::Send {
            ip,
            message,
            to_port,
        } => {
            let to_port = to_port
                .or((port != 0).then_some(port))
                .context("no destination port: pass --to-port, or a nonzero --port")?;
            let destination = SocketAddrV4::new(ip, to_port);
            let messenger = bind(bind_address, port, buffer_size)?;
            messenger
                .send_to_endpoint(destination, message.as_bytes())
                .with_context(|| format!("sending to {destination}"))?;
        }
        Command::Listen {
            timeout_ms,
            poll_ms,
            count,
            for_ms,
        } => {
            let messenger = bind(bind_address, port, buffer_size)?;
            let deadline = for_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
            if let Some(for_ms) = for_ms {
                // Ends a wait in progress promptly; the deadline itself is enforced by `listen`,
                // since an interrupt landing between two waits is forgotten.
                let interrupter = messenger.interrupter();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(for_ms));
                    interrupter.interrupt();
                });
            }
            listen(
                &messenger,
                out,
                Duration::from_millis(timeout_ms),
                Duration::from_millis(poll_ms),
                count,
                deadline,
            )?;
        }
    }
    Ok(())
}

fn bind(
    bind_address: Ipv4Addr,
    port: u16,
    buffer_size: usize,
) -> Result<UdpMessenger<StdPlatform>> {
    let mut messenger = UdpMessenger::new(StdPlatform::new(bind_address));
    messenger
        .bind(port, buffer_size)
        .with_context(|| format!("binding {bind_address}:{port}"))?;
    Ok(messenger)
}

fn listen(
    messenger: &UdpMessenger<StdPlatform>,
    out: &mut dyn Write,
    timeout: Duration,
    poll_interval: Duration,
    count: Option<usize>,
    deadline: Option<Instant>,
) -> Result<()> {
    let mut received = 0;
    while count.is_none_or(|count| received < count) {
        let wait = match deadline {
            None => timeout,
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => timeout.min(left),
                _ => break,
            },
        };
        let mut map = PacketMap::new();
        match messenger.receive_into(&mut map, wait, poll_interval) {
            Ok(()) => {}
            Err(ReceiveError::NoResponse) => continue,
            Err(e) => return Err(e).context("receiving"),
        }
        for (source, payloads) in map {
            for payload in payloads {
                writeln!(out, "{source}: {}", String::from_utf8_lossy(&payload))?;
                received += 1;
            }
        }
    }
    Ok(())
}

/// The messenger result code behind `err`, if it came from a messenger operation.
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    if let Some(e) = err.downcast_ref::<BindError>() {
        Some(e.code())
    } else if let Some(e) = err.downcast_ref::<SendError>() {
        Some(e.code())
    } else {
        err.downcast_ref::<ReceiveError>().map(ReceiveError::code)
    }
}

/// Process exit status for a run that ended with `code`.
///
/// `None` covers failures outside the messenger, such as bad arguments or output errors.
pub fn exit_status(code: Option<ErrorCode>) -> u8 {
    match code {
        Some(ErrorCode::Ok) => 0,
        None => 1,
        Some(ErrorCode::SocketError) => 2,
        Some(ErrorCode::NoResponse) => 3,
    }
}
