use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tracing::debug;

use crate::protocol::command::{split_request, CommandError, Verb};
use crate::protocol::resp::{Resp, RespConnection};
use crate::registry::ConnectionId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection-scoped state: a stable identity and the MULTI queue. The
/// keyspace and registry are process-wide; everything here dies with the
/// connection.
pub struct Session {
    pub id: ConnectionId,
    transaction: Option<Vec<(Verb, Vec<String>)>>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            transaction: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn begin(&mut self) {
        self.transaction = Some(Vec::new());
    }

    pub fn enqueue(&mut self, verb: Verb, args: Vec<String>) {
        if let Some(queue) = &mut self.transaction {
            queue.push((verb, args));
        }
    }

    pub fn take(&mut self) -> Option<Vec<(Verb, Vec<String>)>> {
        self.transaction.take()
    }
}

/// Role-specific connection handling over the shared request loop. The
/// default methods own frame reading, transaction gating and error-to-frame
/// conversion; implementations supply command execution.
pub trait ConnectionHandler {
    fn session(&mut self) -> &mut Session;

    /// Executes one command. `request` carries the client's original frame
    /// for top-level commands and is absent for commands replayed from a
    /// transaction queue.
    fn execute(
        &mut self,
        verb: Verb,
        args: &[String],
        request: Option<&Resp>,
    ) -> Result<Vec<Resp>, CommandError>;

    /// Runs after the reply for a frame has been flushed; the PSYNC takeover
    /// hooks in here.
    fn after_reply(&mut self, _connection: &mut RespConnection) -> Result<()> {
        Ok(())
    }

    fn handle_connection(&mut self, stream: TcpStream) -> Result<()> {
        let mut connection = RespConnection::new(stream);
        loop {
            let (_, frame) = connection.read_frame()?;
            let replies = self.handle_frame(&frame)?;
            connection.send_frames(&replies)?;
            self.after_reply(&mut connection)?;
        }
    }

    /// Dispatches one request frame. A malformed frame is a protocol error
    /// and propagates out to close the connection; command failures become
    /// error frames.
    fn handle_frame(&mut self, frame: &Resp) -> Result<Vec<Resp>> {
        let (name, args) = split_request(frame)?;
        let verb = match name.parse::<Verb>() {
            Ok(verb) => verb,
            Err(err) => return Ok(vec![Resp::Error(err.to_string())]),
        };

        if self.session().in_transaction() && !matches!(verb, Verb::Exec | Verb::Discard) {
            self.session().enqueue(verb, args);
            return Ok(vec![Resp::simple("QUEUED")]);
        }

        let replies = match verb {
            Verb::Multi => {
                self.session().begin();
                vec![Resp::simple("OK")]
            }
            Verb::Exec => match self.session().take() {
                None => vec![Resp::Error("EXEC without MULTI".to_string())],
                Some(queued) => {
                    let mut replies = Vec::with_capacity(queued.len());
                    for (verb, args) in queued {
                        // PSYNC replies with more than one frame and takes
                        // over the connection; it never replays from the queue
                        if verb == Verb::Psync {
                            replies.push(Resp::Error(
                                "PSYNC is not allowed in transactions".to_string(),
                            ));
                            continue;
                        }
                        match self.execute(verb, &args, None) {
                            Ok(frames) => {
                                replies.push(frames.into_iter().next().unwrap_or(Resp::NullBulk))
                            }
                            Err(err) => replies.push(Resp::Error(err.to_string())),
                        }
                    }
                    vec![Resp::Array(replies)]
                }
            },
            Verb::Discard => match self.session().take() {
                None => vec![Resp::Error("DISCARD without MULTI".to_string())],
                Some(_) => vec![Resp::simple("OK")],
            },
            _ => match self.execute(verb, &args, Some(frame)) {
                Ok(frames) => frames,
                Err(err) => {
                    debug!(%verb, %err, "command failed");
                    vec![Resp::Error(err.to_string())]
                }
            },
        };
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Executes against a tiny counter so transaction mechanics can be
    /// observed without a keyspace or sockets.
    struct StubHandler {
        session: Session,
        counter: i64,
        executed: Vec<Verb>,
    }

    impl StubHandler {
        fn new() -> Self {
            StubHandler {
                session: Session::new(),
                counter: 0,
                executed: Vec::new(),
            }
        }

        fn dispatch(&mut self, parts: &[&str]) -> Vec<Resp> {
            self.handle_frame(&Resp::command(parts)).unwrap()
        }
    }

    impl ConnectionHandler for StubHandler {
        fn session(&mut self) -> &mut Session {
            &mut self.session
        }

        fn execute(
            &mut self,
            verb: Verb,
            _args: &[String],
            _request: Option<&Resp>,
        ) -> Result<Vec<Resp>, CommandError> {
            self.executed.push(verb);
            match verb {
                Verb::Ping => Ok(vec![Resp::simple("PONG")]),
                Verb::Set => Ok(vec![Resp::simple("OK")]),
                Verb::Incr => {
                    self.counter += 1;
                    Ok(vec![Resp::Int(self.counter)])
                }
                Verb::Get => Err(CommandError::new("boom")),
                _ => Ok(vec![Resp::NullBulk]),
            }
        }
    }

    #[test]
    fn transaction_queues_and_replays_in_order() {
        let mut handler = StubHandler::new();
        assert_eq!(handler.dispatch(&["MULTI"]), vec![Resp::simple("OK")]);
        assert_eq!(
            handler.dispatch(&["SET", "a", "1"]),
            vec![Resp::simple("QUEUED")]
        );
        assert_eq!(handler.dispatch(&["INCR", "a"]), vec![Resp::simple("QUEUED")]);
        // nothing ran while queued
        assert!(handler.executed.is_empty());

        assert_eq!(
            handler.dispatch(&["EXEC"]),
            vec![Resp::Array(vec![Resp::simple("OK"), Resp::Int(1)])]
        );
        assert_eq!(handler.executed, vec![Verb::Set, Verb::Incr]);
    }

    #[test]
    fn queued_errors_keep_their_position_in_the_exec_reply() {
        let mut handler = StubHandler::new();
        handler.dispatch(&["MULTI"]);
        handler.dispatch(&["INCR", "a"]);
        handler.dispatch(&["GET", "a"]);
        handler.dispatch(&["INCR", "a"]);
        assert_eq!(
            handler.dispatch(&["EXEC"]),
            vec![Resp::Array(vec![
                Resp::Int(1),
                Resp::Error("boom".to_string()),
                Resp::Int(2),
            ])]
        );
    }

    #[test]
    fn queued_psync_is_rejected_instead_of_replayed() {
        let mut handler = StubHandler::new();
        handler.dispatch(&["MULTI"]);
        assert_eq!(
            handler.dispatch(&["PSYNC", "?", "-1"]),
            vec![Resp::simple("QUEUED")]
        );
        handler.dispatch(&["INCR", "a"]);
        assert_eq!(
            handler.dispatch(&["EXEC"]),
            vec![Resp::Array(vec![
                Resp::Error("PSYNC is not allowed in transactions".to_string()),
                Resp::Int(1),
            ])]
        );
        // the rejected command never reached execution
        assert_eq!(handler.executed, vec![Verb::Incr]);
    }

    #[test]
    fn exec_and_discard_require_an_open_transaction() {
        let mut handler = StubHandler::new();
        assert_eq!(
            handler.dispatch(&["EXEC"]),
            vec![Resp::Error("EXEC without MULTI".to_string())]
        );
        assert_eq!(
            handler.dispatch(&["DISCARD"]),
            vec![Resp::Error("DISCARD without MULTI".to_string())]
        );
    }

    #[test]
    fn discard_drops_the_queue_without_executing() {
        let mut handler = StubHandler::new();
        handler.dispatch(&["MULTI"]);
        handler.dispatch(&["INCR", "a"]);
        assert_eq!(handler.dispatch(&["DISCARD"]), vec![Resp::simple("OK")]);
        assert!(handler.executed.is_empty());
        // the connection is usable again
        assert_eq!(handler.dispatch(&["PING"]), vec![Resp::simple("PONG")]);
    }

    #[test]
    fn unknown_verbs_reply_an_error_without_closing() {
        let mut handler = StubHandler::new();
        assert_eq!(
            handler.dispatch(&["FLUSHALL"]),
            vec![Resp::Error("unknown command 'FLUSHALL'".to_string())]
        );
        assert_eq!(handler.dispatch(&["PING"]), vec![Resp::simple("PONG")]);
    }

    #[test]
    fn command_errors_become_error_frames() {
        let mut handler = StubHandler::new();
        assert_eq!(
            handler.dispatch(&["GET", "a"]),
            vec![Resp::Error("boom".to_string())]
        );
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(Session::new().id, Session::new().id);
    }
}
