use kiln::{Frame, Opcode, Request, Router, Server, WebSocketConnection, WebSocketHandler};
use std::{sync::Mutex, time::Duration};

const HISTORY: usize = 50;

/// Replies to every message and replays the latest ones to new clients.
#[derive(Default)]
struct Chat {
    history: Mutex<Vec<String>>,
}

impl WebSocketHandler for Chat {
    async fn on_open(&self, conn: &mut WebSocketConnection, req: &Request) {
        let backlog = match self.history.lock() {
            Ok(history) => history.clone(),
            Err(_) => return,
        };
        let who = req.query("name").unwrap_or("guest").to_owned();

        for line in backlog {
            if conn.send_text(&line).await.is_err() {
                return;
            }
        }
        let _ = conn.send_text(&format!("welcome, {who}")).await;
    }

    async fn on_frame(&self, _: &mut WebSocketConnection, frame: Frame) -> Option<Vec<Frame>> {
        if frame.opcode != Opcode::Text {
            return None;
        }
        let line = format!("> {}", frame.as_text()?);

        if let Ok(mut history) = self.history.lock() {
            if history.len() == HISTORY {
                history.remove(0);
            }
            history.push(line.clone());
        }
        Some(vec![Frame::text(line)])
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    async fn on_tick(&self, conn: &mut WebSocketConnection) -> kiln::Result<()> {
        conn.ping(b"").await
    }
}

#[tokio::main]
async fn main() {
    let router = Router::builder()
        .websocket("/chat", Chat::default())
        .build();

    Server::builder()
        .bind("127.0.0.1", 8080)
        .unwrap()
        .router(router)
        .build()
        .launch()
        .await;
}
