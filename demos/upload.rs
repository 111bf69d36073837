use kiln::{Handled, Handler, Method, Request, Response, Router, Server, StatusCode};

const FORM: &str = r#"<!doctype html>
<form method="post" action="/upload" enctype="multipart/form-data">
  <input name="title">
  <input type="file" name="file" multiple>
  <button>Upload</button>
</form>"#;

struct Index;

impl Handler for Index {
    async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
        resp.status(StatusCode::OK)
            .header("content-type", "text/html; charset=utf-8")
            .body(FORM)
    }
}

struct Upload;

impl Handler for Upload {
    async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
        if req.method() != Method::Post {
            return resp.status(StatusCode::METHOD_NOT_ALLOWED).header("allow", "POST").empty();
        }

        let form = match req.multipart().await {
            Ok(form) => form,
            Err(err) => return resp.status(err.status()).body(err.to_string()),
        };
        let title = form.field("title").unwrap_or("untitled").to_owned();

        let mut saved = Vec::new();
        for (index, file) in form.into_files().into_iter().enumerate() {
            let name = file.filename().unwrap_or("blob").to_owned();
            let size = file.len();

            if file.persist(format!("uploads/{index}.bin")).await.is_err() {
                return resp.status(StatusCode::INTERNAL_SERVER_ERROR).empty();
            }
            saved.push(serde_json::json!({ "name": name, "size": size }));
        }

        resp.status(StatusCode::OK)
            .json(&serde_json::json!({ "title": title, "files": saved }))
    }
}

#[tokio::main]
async fn main() {
    tokio::fs::create_dir_all("uploads").await.unwrap();

    let router = Router::builder()
        .route("/", Index)
        .route("/upload", Upload)
        .build();

    Server::builder()
        .bind("127.0.0.1", 8080)
        .unwrap()
        .router(router)
        .build()
        .launch()
        .await;
}
