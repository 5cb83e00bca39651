//! Command socket server
//!
//! Optional TCP listener accepting a one-request-per-connection line
//! protocol:
//!
//! - `set.<node>.<method>(args)` invokes a node method
//! - `get.<node>.<attr>` reads an attribute
//! - `<node> <shell-cmd>` runs a shell command inside the node
//!
//! The response is the return value serialized as UTF-8 text; the
//! connection closes after one request. Requests are forwarded into the
//! engine mailbox, so the server never touches topology state itself.

use crate::cleanup::{CleanupAction, CleanupRegistry};
use crate::engine::EngineCommand;
use crate::EngineError;
use rfmodel::Position;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_BIND: (&str, u16) = ("127.0.0.1", 12345);

/// One parsed request line.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Set {
        node: String,
        method: String,
        args: String,
    },
    Get {
        node: String,
        attr: String,
    },
    Shell {
        node: String,
        argv: Vec<String>,
    },
}

/// Parse a protocol line. Errors are user-facing strings echoed back on
/// the connection.
pub fn parse_request(line: &str) -> Result<Request, String> {
    let line = line.trim();
    if line.is_empty() {
        return Err("empty request".into());
    }
    if let Some(rest) = line.strip_prefix("set.") {
        let (node, call) = rest
            .split_once('.')
            .ok_or_else(|| "usage: set.node.method()".to_string())?;
        let (method, args) = match call.split_once('(') {
            Some((m, a)) => (m, a.trim_end_matches(')')),
            None => return Err("usage: set.node.method()".to_string()),
        };
        Ok(Request::Set {
            node: node.to_string(),
            method: method.to_string(),
            args: args.trim_matches(|c| c == '"' || c == '\'').to_string(),
        })
    } else if let Some(rest) = line.strip_prefix("get.") {
        let (node, attr) = rest
            .split_once('.')
            .ok_or_else(|| "usage: get.node.attr".to_string())?;
        Ok(Request::Get {
            node: node.to_string(),
            attr: attr.to_string(),
        })
    } else {
        let mut words = line.split_whitespace();
        let node = words
            .next()
            .ok_or_else(|| "empty request".to_string())?
            .to_string();
        let argv: Vec<String> = words.map(String::from).collect();
        if argv.is_empty() {
            return Err(format!("usage: {} <shell-cmd>", node));
        }
        Ok(Request::Shell { node, argv })
    }
}

/// Dispatch a parsed request through the engine mailbox and render the
/// reply text.
pub async fn dispatch(
    req: Request,
    mailbox: &mpsc::Sender<EngineCommand>,
) -> String {
    match req {
        Request::Set { node, method, args } => match method.as_str() {
            "setPosition" => {
                let pos: Position = match args.parse() {
                    Ok(pos) => pos,
                    Err(e) => return format!("error: {}", e),
                };
                let (reply, rx) = oneshot::channel();
                if mailbox
                    .send(EngineCommand::SetPosition { node, pos, reply })
                    .await
                    .is_err()
                {
                    return "error: engine is gone".into();
                }
                match rx.await {
                    Ok(Ok(())) => "command accepted!".into(),
                    Ok(Err(e)) => format!("error: {}", e),
                    Err(_) => "error: engine is gone".into(),
                }
            }
            "pauseSimulation" => {
                let _ = mailbox.send(EngineCommand::PauseSimulation).await;
                "command accepted!".into()
            }
            "startSimulation" => {
                let _ = mailbox.send(EngineCommand::StartSimulation).await;
                "command accepted!".into()
            }
            _ => "unrecognized method!".into(),
        },
        Request::Get { node, attr } => {
            let (reply, rx) = oneshot::channel();
            if mailbox
                .send(EngineCommand::GetAttr { node, attr, reply })
                .await
                .is_err()
            {
                return "error: engine is gone".into();
            }
            match rx.await {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => format!("error: {}", e),
                Err(_) => "error: engine is gone".into(),
            }
        }
        Request::Shell { node, argv } => {
            let (reply, rx) = oneshot::channel();
            if mailbox
                .send(EngineCommand::NodeShell { node, argv, reply })
                .await
                .is_err()
            {
                return "error: engine is gone".into();
            }
            match rx.await {
                Ok(Ok(out)) => {
                    if out.is_empty() {
                        "command accepted!".into()
                    } else {
                        out
                    }
                }
                Ok(Err(e)) => format!("error: {}", e),
                Err(_) => "error: engine is gone".into(),
            }
        }
    }
}

/// Run the listener until cancelled. The port's inverse (fuser kill) is
/// registered before binding.
pub async fn serve(
    bind: (String, u16),
    mailbox: mpsc::Sender<EngineCommand>,
    cleanup: Arc<CleanupRegistry>,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), EngineError> {
    cleanup.record(CleanupAction::FuserKillPort(bind.1));
    let listener = TcpListener::bind((bind.0.as_str(), bind.1))
        .await
        .map_err(|e| EngineError::Resource(netres::NetresError::Io(e)))?;
    info!("command socket listening on {}:{}", bind.0, bind.1);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                debug!("command connection from {}", addr);
                let mailbox = mailbox.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    // One request per connection.
                    let response = match lines.next_line().await {
                        Ok(Some(line)) => match parse_request(&line) {
                            Ok(req) => dispatch(req, &mailbox).await,
                            Err(e) => e,
                        },
                        Ok(None) => "empty request".into(),
                        Err(e) => format!("error: {}", e),
                    };
                    let _ = write.write_all(response.as_bytes()).await;
                    let _ = write.shutdown().await;
                });
            }
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }
    info!("command socket closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn parses_the_three_forms() {
        assert_eq!(
            parse_request("set.sta1.setPosition(\"10,20,0\")").unwrap(),
            Request::Set {
                node: "sta1".into(),
                method: "setPosition".into(),
                args: "10,20,0".into(),
            }
        );
        assert_eq!(
            parse_request("get.sta1.position").unwrap(),
            Request::Get {
                node: "sta1".into(),
                attr: "position".into(),
            }
        );
        assert_eq!(
            parse_request("sta1 ip addr show").unwrap(),
            Request::Shell {
                node: "sta1".into(),
                argv: vec!["ip".into(), "addr".into(), "show".into()],
            }
        );
    }

    #[test]
    fn malformed_lines_error_with_usage() {
        assert!(parse_request("set.sta1").unwrap_err().contains("usage"));
        assert!(parse_request("get.sta1").unwrap_err().contains("usage"));
        assert!(parse_request("sta1").unwrap_err().contains("usage"));
        assert!(parse_request("").is_err());
    }

    #[test]
    fn unknown_set_method_is_reported() {
        let req = parse_request("set.sta1.teleport(1,2)").unwrap();
        assert!(matches!(req, Request::Set { ref method, .. } if method == "teleport"));
    }

    /// End-to-end: a stub engine loop answers over a real TCP socket.
    #[tokio::test]
    async fn one_request_per_connection() {
        let (tx, mut rx) = mpsc::channel(8);
        // Stub engine: answers GetAttr with a canned value.
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let EngineCommand::GetAttr { node, attr, reply } = cmd {
                    let _ = reply.send(Ok(format!("{}:{}", node, attr)));
                }
            }
        });

        let cleanup = Arc::new(CleanupRegistry::new());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        // Bind on an ephemeral port.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let bind = ("127.0.0.1".to_string(), port);
        tokio::spawn(serve(bind, tx, cleanup.clone(), cancel_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        conn.write_all(b"get.sta1.position\n").await.unwrap();
        let mut buf = String::new();
        conn.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "sta1:position");

        // The port inverse was registered before binding.
        assert_eq!(cleanup.len(), 1);
    }
}
