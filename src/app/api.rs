//! Control socket server: decodes fixed-size request records, forwards
//! them to the supervisor loop and writes the reply in-band.

use crate::app::proto::{Op, Record, RECORD_LEN};
use crate::manager::PowerMode;
use crate::sup::{Cmd, Event, Reply};
use anyhow::{Context, Result};
use log::{debug, error};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

pub struct Api {
    socket: PathBuf,
    tx: UnboundedSender<Event>,
}

impl Api {
    pub fn new<P: AsRef<Path>>(socket: P, tx: UnboundedSender<Event>) -> Api {
        Api {
            socket: socket.as_ref().to_path_buf(),
            tx,
        }
    }

    pub async fn serve(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket);
        let listener = UnixListener::bind(&self.socket).context("failed to listen for socket")?;
        loop {
            if let Ok((stream, _addr)) = listener.accept().await {
                tokio::spawn(Self::handle(stream, self.tx.clone()));
            }
        }
    }

    async fn handle(mut stream: UnixStream, tx: UnboundedSender<Event>) {
        let mut buf = [0u8; RECORD_LEN];
        if let Err(err) = stream.read_exact(&mut buf).await {
            debug!("short control request: {}", err);
            let _ = stream.write_all(&Record::nack("short request").encode()).await;
            return;
        }

        let request = match Record::decode(&buf) {
            Ok(request) => request,
            Err(err) => {
                let _ = stream.write_all(&Record::nack(&err.to_string()).encode()).await;
                return;
            }
        };

        let reply = match Self::dispatch(request, &tx).await {
            Ok(reply) => reply,
            Err(err) => Record::nack(&format!("{:#}", err)),
        };

        if let Err(err) = stream.write_all(&reply.encode()).await {
            error!("failed to send control reply: {}", err);
        }
        let _ = stream.flush().await;
    }

    async fn dispatch(request: Record, tx: &UnboundedSender<Event>) -> Result<Record> {
        let cmd = match to_cmd(&request) {
            Ok(cmd) => cmd,
            Err(msg) => return Ok(Record::nack(&msg)),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Event::Control {
            cmd,
            reply: reply_tx,
        })
        .context("supervisor loop is gone")?;
        let reply = reply_rx.await.context("supervisor dropped the request")?;

        Ok(match reply {
            Reply::Ack => Record::ack(),
            Reply::AckText(text) => Record::ack_text(&text),
            Reply::Nack(text) => Record::nack(&text),
        })
    }
}

/// Requests that act on a service carry its identity in the data
/// buffer; a missing identity is a protocol error, not a lookup miss.
fn to_cmd(request: &Record) -> Result<Cmd, String> {
    let ident = || -> Result<String, String> {
        let text = request.text();
        if text.is_empty() {
            Err("missing service name".into())
        } else {
            Ok(text)
        }
    };
    let name = || -> Result<String, String> {
        let text = request.text();
        if text.is_empty() {
            Err("missing condition name".into())
        } else {
            Ok(text)
        }
    };

    let cmd = match request.op {
        Op::Nop => Cmd::Nop,
        Op::RunlevelGet => Cmd::RunlevelGet,
        Op::RunlevelSet => Cmd::RunlevelSet {
            level: request.level,
        },
        Op::Reload => Cmd::Reload,
        Op::Start => Cmd::Start { ident: ident()? },
        Op::Stop => Cmd::Stop { ident: ident()? },
        Op::Restart => Cmd::Restart { ident: ident()? },
        Op::Signal => Cmd::Signal {
            ident: ident()?,
            signo: request.level as i32,
        },
        Op::Status => Cmd::Status { ident: ident()? },
        Op::Query => Cmd::Query { ident: ident()? },
        Op::SvcIter => Cmd::Iter {
            index: request.level as usize,
        },
        Op::CondGet => Cmd::CondGet { name: name()? },
        Op::CondSet => Cmd::CondSet { name: name()? },
        Op::CondClear => Cmd::CondClear { name: name()? },
        Op::Debug => Cmd::Debug,
        Op::Reboot => Cmd::Power(PowerMode::Reboot),
        Op::Halt => Cmd::Power(PowerMode::Halt),
        Op::Poweroff => Cmd::Power(PowerMode::Poweroff),
        Op::Suspend => Cmd::Power(PowerMode::Suspend),
        Op::Ack | Op::Nack => return Err("not a request".into()),
    };
    Ok(cmd)
}
