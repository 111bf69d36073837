use kiln::{Handled, Handler, Request, Response, Server, StatusCode};

struct Hello;

impl Handler for Hello {
    async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
        let name = req.query("name").unwrap_or("world");

        resp.status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(format!("Hello, {name}!"))
    }
}

#[tokio::main]
async fn main() {
    Server::builder()
        .bind("127.0.0.1", 8080)
        .unwrap()
        .handler(Hello)
        .build()
        .launch()
        .await;
}
