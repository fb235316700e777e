use crate::sup::Event;
use log::{debug, error};
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Listening sockets for inetd services. Opening starts an accept loop
/// that turns every connection into an event; closing tears the loop
/// and the socket down.
pub trait Listeners: Send {
    fn open(&mut self, ident: &str, addr: &str);
    fn close(&mut self, ident: &str);
}

pub struct TokioListeners {
    tx: UnboundedSender<Event>,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl TokioListeners {
    pub fn new(tx: UnboundedSender<Event>) -> TokioListeners {
        TokioListeners {
            tx,
            tasks: HashMap::new(),
        }
    }
}

impl Listeners for TokioListeners {
    fn open(&mut self, ident: &str, addr: &str) {
        self.close(ident);

        // ":2323" is shorthand for all interfaces
        let addr = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };

        let tx = self.tx.clone();
        let owner = ident.to_string();
        let task = tokio::spawn(async move {
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("inetd {}: failed to bind {}: {}", owner, addr, err);
                    return;
                }
            };
            debug!("inetd {}: listening on {}", owner, addr);

            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("inetd {}: connection from {}", owner, peer);
                        let stream = match stream.into_std() {
                            Ok(stream) => stream,
                            Err(err) => {
                                error!("inetd {}: failed to detach stream: {}", owner, err);
                                continue;
                            }
                        };
                        // the child inherits the socket as stdio; make
                        // sure it is in blocking mode again
                        if let Err(err) = stream.set_nonblocking(false) {
                            error!("inetd {}: {}", owner, err);
                            continue;
                        }
                        let _ = tx.send(Event::InetdConn {
                            ident: owner.clone(),
                            stream,
                        });
                    }
                    Err(err) => {
                        error!("inetd {}: accept failed: {}", owner, err);
                    }
                }
            }
        });

        self.tasks.insert(ident.to_string(), task);
    }

    fn close(&mut self, ident: &str) {
        if let Some(task) = self.tasks.remove(ident) {
            debug!("inetd {}: closing listener", ident);
            task.abort();
        }
    }
}
