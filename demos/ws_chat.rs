//! Broadcast chat: every text message is relayed to all connected clients
//! by a separate thread through `WsSender`.

use maker_ws::{
    BodyData, CloseCode, ConnectionId, Handled, Handler, Message, Request, Response, Server,
    StatusCode, WsContext,
};
use std::{
    collections::HashSet,
    sync::{mpsc, Arc, Mutex},
    thread,
};
use tokio::net::TcpListener;

struct Chat {
    members: Arc<Mutex<HashSet<ConnectionId>>>,
    outbox: Mutex<mpsc::Sender<String>>,
}

impl Handler for Chat {
    fn handle(&self, req: &Request, _: &BodyData, resp: &mut Response) -> Handled {
        match req.path() {
            "/chat" => resp.upgrade_websocket(req),
            "/members" => {
                let count = self.members.lock().unwrap().len();
                resp.status(StatusCode::Ok).body(count)
            }
            _ => resp.status(StatusCode::NotFound).body("Not found"),
        }
    }

    fn on_open(&self, ctx: &mut WsContext) {
        self.members.lock().unwrap().insert(ctx.id());
        ctx.send_text("welcome to the chat");
    }

    fn on_message(&self, ctx: &mut WsContext, message: Message) {
        if let Message::Text(text) = message {
            let _ = self.outbox.lock().unwrap().send(format!("{}: {text}", ctx.id()));
        }
    }

    fn on_close(&self, id: ConnectionId, _: CloseCode) {
        self.members.lock().unwrap().remove(&id);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .init();

    let members = Arc::new(Mutex::new(HashSet::new()));
    let (tx, rx) = mpsc::channel::<String>();

    let server = Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(Chat {
            members: members.clone(),
            outbox: Mutex::new(tx),
        })
        .build()
        .unwrap();

    let sender = server.ws_sender();
    thread::spawn(move || {
        for line in rx {
            let ids: Vec<_> = members.lock().unwrap().iter().copied().collect();
            for id in ids {
                let _ = sender.send_text(id, line.clone());
            }
        }
    });

    server.launch().await;
}
