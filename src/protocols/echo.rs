//! Line-echo protocol.
//!
//! Greets each client, echoes every CRLF-terminated line back, and says
//! goodbye on `/quit`. Echoes are answered straight from the read
//! callback so pipelined lines come back in the order they were sent;
//! the goodbye is composed on a worker thread pool and travels back
//! through the response dispatcher, exercising the cross-thread write
//! path.

use crate::dispatcher::ResponseDispatcher;
use crate::pool::ThreadPool;
use crate::protocol::{Protocol, ProtocolContext};
use crate::stream::{Connection, PostWrite};
use std::io;
use std::rc::Rc;
use tracing::debug;

const GREETING: &[u8] = b"Hello!\n";
const GOODBYE: &[u8] = b"Goodbye!\r\n";
const QUIT: &[u8] = b"/quit";

pub struct EchoProtocol {
    pool: Option<Rc<ThreadPool>>,
}

impl EchoProtocol {
    pub fn new() -> Self {
        EchoProtocol { pool: None }
    }
}

impl Default for EchoProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for EchoProtocol {
    fn start(&mut self, ctx: &ProtocolContext<'_>) -> io::Result<()> {
        let threads = ctx
            .options
            .get("echo-threads")
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);
        self.pool = Some(Rc::new(ThreadPool::new("echo", threads)?));
        Ok(())
    }

    fn stop(&mut self) {
        // Remaining pool references die with their pending reads when
        // the server closes the connections; the last one joins the
        // workers.
        self.pool = None;
    }

    fn accept(&mut self, ctx: &ProtocolContext<'_>, conn: &Rc<Connection>) {
        let Some(pool) = self.pool.as_ref() else {
            debug!("accept before start, dropping connection");
            conn.close();
            return;
        };

        ctx.dispatcher.enqueue(conn.id(), GREETING, None);
        arm_line_read(ctx.dispatcher.clone(), Rc::clone(pool), conn);
    }
}

/// Wait for the next CRLF-terminated line and answer it.
///
/// Echo replies are enqueued from the callback itself: handing each line
/// to a separate pool job would let a later line overtake an earlier one
/// on its way into the dispatcher's FIFO. Only the final goodbye goes
/// through the pool, where ordering cannot be disturbed because nothing
/// follows it.
fn arm_line_read(dispatcher: ResponseDispatcher, pool: Rc<ThreadPool>, conn: &Rc<Connection>) {
    let result = conn.read_until(b"\r\n", move |conn, line| {
        let id = conn.id();
        let line = line.to_vec();

        if line.strip_suffix(b"\r\n") == Some(QUIT) {
            let reply = dispatcher.clone();
            pool.execute(move || reply.enqueue(id, GOODBYE, Some(PostWrite::Close)));
            return;
        }

        dispatcher.enqueue(id, line, None);
        arm_line_read(dispatcher, pool, conn);
    });

    if let Err(e) = result {
        debug!(error = %e, "connection closed before read could be armed");
    }
}
