//! Echo server. Try it with `websocat ws://127.0.0.1:8080/ws`.

use maker_ws::{
    BodyData, CloseCode, ConnectionId, FormParser, Handled, Handler, Message, Request, Response,
    Server, StatusCode, WsContext,
};
use tokio::net::TcpListener;

struct Echo;

impl Handler for Echo {
    fn handle(&self, req: &Request, body: &BodyData, resp: &mut Response) -> Handled {
        match (req.method().as_str(), req.path()) {
            ("GET", "/ws") => resp.upgrade_websocket(req),
            ("POST", "/form") => resp
                .status(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .body_with(|w| {
                    for field in body.fields() {
                        w.write(&field.name);
                        w.write(" = ");
                        w.write(field.text.as_deref().unwrap_or("<binary>"));
                        w.write("\n");
                    }
                }),
            _ => resp
                .status(StatusCode::NotFound)
                .body("Connect a WebSocket client to /ws"),
        }
    }

    fn on_open(&self, ctx: &mut WsContext) {
        tracing::info!(id = %ctx.id(), "Client connected");
    }

    fn on_message(&self, ctx: &mut WsContext, message: Message) {
        match message {
            Message::Text("/quit") => ctx.close(CloseCode::Normal),
            Message::Text(text) => ctx.send_text(text),
            Message::Binary(data) => ctx.send_binary(data),
        }
    }

    fn on_close(&self, id: ConnectionId, code: CloseCode) {
        tracing::info!(%id, code = code.as_u16(), "Client disconnected");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(Echo)
        .body_parser(FormParser)
        .build()
        .unwrap()
        .launch()
        .await;
}
