//! The embedded control client: connects to the supervisor's socket,
//! sends one request record, prints the reply. Failures map onto the
//! conventional sysexits-style codes the test harness keys off.

use crate::app::proto::{Op, Record, RECORD_LEN};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("bad argument: {0}")]
    BadArg(String),

    #[error("{0}")]
    NotFound(String),

    #[error("failed talking to the supervisor: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Rejected(String),
}

impl ClientError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Usage(_) => 2,
            ClientError::UnknownCommand(_) => 3,
            ClientError::BadArg(_) => 65,
            ClientError::NotFound(_) => 69,
            ClientError::Io(_) => 71,
            ClientError::Rejected(_) => 1,
        }
    }
}

type Result<T> = std::result::Result<T, ClientError>;

pub struct Client {
    socket: PathBuf,
}

impl Client {
    pub fn new<P: AsRef<Path>>(socket: P) -> Client {
        Client {
            socket: socket.as_ref().to_path_buf(),
        }
    }

    async fn call(&self, request: Record) -> Result<Record> {
        let mut stream = UnixStream::connect(&self.socket).await?;
        stream.write_all(&request.encode()).await?;
        stream.flush().await?;

        let mut buf = [0u8; RECORD_LEN];
        stream.read_exact(&mut buf).await?;
        Record::decode(&buf)
            .map_err(|err| ClientError::Rejected(err.to_string()))
    }

    /// Call and convert a nack into an error. Lookup misses get their
    /// own exit code.
    async fn expect_ack(&self, request: Record) -> Result<Record> {
        let reply = self.call(request).await?;
        match reply.op {
            Op::Nack => {
                let msg = reply.text();
                if msg.contains("unknown") {
                    Err(ClientError::NotFound(msg))
                } else {
                    Err(ClientError::Rejected(msg))
                }
            }
            _ => Ok(reply),
        }
    }

    pub async fn status(&self, ident: &str) -> Result<()> {
        let reply = self
            .expect_ack(Record::with_text(Op::Status, 0, ident))
            .await?;
        // pretty-print the JSON payload as YAML
        match serde_json::from_str::<serde_json::Value>(&reply.text()) {
            Ok(v) => print!("{}", serde_yaml::to_string(&v).unwrap_or_default()),
            Err(_) => println!("{}", reply.text()),
        }
        Ok(())
    }

    /// Enumerate all services, one row at a time.
    pub async fn list(&self) -> Result<()> {
        println!(
            "{:<24} {:>9}{:<13} {:>7} {:<9} {}",
            "NAME", "STATE", "", "PID", "LEVELS", "DESCRIPTION"
        );
        for index in 0.. {
            let reply = self.call(Record::new(Op::SvcIter, index)).await?;
            match reply.op {
                Op::Ack => println!("{}", reply.text()),
                _ => break,
            }
        }
        Ok(())
    }

    pub async fn start(&self, ident: &str) -> Result<()> {
        self.expect_ack(Record::with_text(Op::Start, 0, ident)).await?;
        Ok(())
    }

    pub async fn stop(&self, ident: &str) -> Result<()> {
        self.expect_ack(Record::with_text(Op::Stop, 0, ident)).await?;
        Ok(())
    }

    pub async fn restart(&self, ident: &str) -> Result<()> {
        self.expect_ack(Record::with_text(Op::Restart, 0, ident))
            .await?;
        Ok(())
    }

    pub async fn signal(&self, ident: &str, signal: &str) -> Result<()> {
        let signo = parse_signal(signal)?;
        self.expect_ack(Record::with_text(Op::Signal, signo as u32, ident))
            .await?;
        Ok(())
    }

    pub async fn reload(&self) -> Result<()> {
        self.expect_ack(Record::new(Op::Reload, 0)).await?;
        Ok(())
    }

    pub async fn runlevel(&self, level: Option<&str>) -> Result<()> {
        match level {
            None => {
                let reply = self.expect_ack(Record::new(Op::RunlevelGet, 0)).await?;
                println!("{}", reply.text());
            }
            Some(level) => {
                let level = parse_runlevel(level)?;
                self.expect_ack(Record::new(Op::RunlevelSet, level)).await?;
            }
        }
        Ok(())
    }

    pub async fn query(&self, ident: &str) -> Result<()> {
        self.expect_ack(Record::with_text(Op::Query, 0, ident)).await?;
        Ok(())
    }

    pub async fn cond(&self, op: &str, name: &str) -> Result<()> {
        let op = match op {
            "get" => Op::CondGet,
            "set" => Op::CondSet,
            "clear" => Op::CondClear,
            other => return Err(ClientError::UnknownCommand(other.into())),
        };
        let reply = self.expect_ack(Record::with_text(op, 0, name)).await?;
        if op == Op::CondGet {
            println!("{}", reply.text());
        }
        Ok(())
    }

    pub async fn debug(&self) -> Result<()> {
        let reply = self.expect_ack(Record::new(Op::Debug, 0)).await?;
        println!("{}", reply.text());
        Ok(())
    }

    pub async fn power(&self, what: Op) -> Result<()> {
        self.expect_ack(Record::new(what, 0)).await?;
        Ok(())
    }
}

fn parse_signal(s: &str) -> Result<i32> {
    if let Ok(n) = s.parse::<i32>() {
        return Ok(n);
    }
    let name = s.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let signo = match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "KILL" => 9,
        "USR1" => 10,
        "USR2" => 12,
        "TERM" => 15,
        "CONT" => 18,
        "STOP" => 19,
        _ => return Err(ClientError::BadArg(format!("unknown signal {:?}", s))),
    };
    Ok(signo)
}

fn parse_runlevel(s: &str) -> Result<u32> {
    match s {
        "S" | "s" => Ok(0),
        _ => match s.parse::<u32>() {
            Ok(level) if level <= 9 => Ok(level),
            _ => Err(ClientError::BadArg(format!("bad runlevel {:?}", s))),
        },
    }
}
