pub mod http;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::context::AppContext;
use crate::frontend::http::{Request, RequestError, Response};
use crate::rumba::RumbaCommand;
use crate::scheduler::SchedulerError;

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

const SSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n";

pub async fn start(listen: SocketAddr, ctx: Arc<AppContext>) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(listen).await?;
    let handle = tokio::spawn(async move {
        log::info!("Listening on {listen}");
        loop {
            match listener.accept().await {
                Ok((stream, _)) => start_session(stream, ctx.clone()),
                Err(e) => log::error!("http accept error: {e:?}"),
            }
        }
    });
    Ok(handle)
}

fn start_session(stream: TcpStream, ctx: Arc<AppContext>) {
    tokio::spawn(async move {
        if let Err(e) = serve(stream, ctx).await {
            log::debug!("http session ended: {e}");
        }
    });
}

async fn serve(stream: TcpStream, ctx: Arc<AppContext>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let request = match http::read_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(RequestError::Rejected { status, message }) => {
            log::debug!("refused request: {message}");
            return Response::text(status, message).write_to(&mut writer).await;
        }
        Err(RequestError::Io(e)) => return Err(e),
    };
    log::debug!("{} {}", request.method, request.path);

    if request.method == "GET" && request.path == "/event" {
        return stream_status(&mut writer, &ctx).await;
    }
    route(&request, &ctx).await.write_to(&mut writer).await
}

/// Pushes the status JSON every `sse_interval` until the client goes away.
async fn stream_status<W: AsyncWrite + Unpin>(writer: &mut W, ctx: &AppContext) -> std::io::Result<()> {
    writer.write_all(SSE_HEAD).await?;
    loop {
        let status = serde_json::to_string(&ctx.status())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        writer.write_all(format!("data: {status}\n\n").as_bytes()).await?;
        writer.flush().await?;
        tokio::time::sleep(ctx.sse_interval).await;
    }
}

pub async fn route(request: &Request, ctx: &Arc<AppContext>) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/pump") => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let played = ctx.scheduler.trigger_all().await;
                log::info!("pump sequence finished, {played} pumps played");
            });
            Response::text(202, "pump sequence started")
        }
        ("GET", "/pumpAllStart") => {
            let opened = ctx.scheduler.trigger_all_start().await;
            Response::text(200, format!("{opened} pumps opened"))
        }
        ("GET", "/pumpAllStop") => match ctx.scheduler.trigger_all_stop().await {
            Ok(pumps) => Response::text(200, format!("pumps closed, {pumps} pumps loaded")),
            Err(e) => Response::text(422, format!("pumps closed, reload failed: {e}")),
        },
        ("GET", "/pumpSingle") => {
            let Some(id) = request.param("id").and_then(|id| id.parse::<u32>().ok()) else {
                return Response::text(400, "expected ?id=<pump>");
            };
            match ctx.scheduler.trigger_single(id).await {
                Ok(()) => Response::text(200, format!("pump {id} opened")),
                Err(e @ SchedulerError::UnknownPump(_)) => Response::text(404, e.to_string()),
            }
        }
        ("GET", "/cancel") => {
            ctx.scheduler.cancel();
            Response::text(200, "running activations cancelled")
        }
        ("GET", "/status") => Response::json(&ctx.status()),
        ("POST", "/upload") => upload(request, ctx).await,
        ("POST", "/emulate") => match request.param("enabled").and_then(|v| v.parse::<bool>().ok()) {
            Some(enabled) => {
                ctx.emulate.set(enabled);
                Response::text(200, format!("emulate {enabled}"))
            }
            None => Response::text(400, "expected ?enabled=true|false"),
        },
        ("GET", "/home") => rumba(ctx, RumbaCommand::Home),
        ("GET", "/move") => rumba(ctx, RumbaCommand::Move),
        _ => Response::text(404, "not found"),
    }
}

async fn upload(request: &Request, ctx: &AppContext) -> Response {
    if request.body.iter().all(u8::is_ascii_whitespace) {
        return Response::text(400, "empty pump table");
    }
    if let Err(e) = store_upload(&ctx.upload_csv, &request.body).await {
        log::error!("could not store upload at {}: {e}", ctx.upload_csv.display());
        return Response::text(500, format!("could not store upload: {e}"));
    }
    match ctx.scheduler.reload().await {
        Ok(pumps) => Response::text(200, format!("{pumps} pumps loaded")),
        Err(e) => Response::text(422, e.to_string()),
    }
}

/// Writes next to `path` and renames over it, so a concurrent reload sees
/// either the old table or the new one, never a partial file.
async fn store_upload(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(format!(".{}.part", UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed)));
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, body).await?;
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }
    Ok(())
}

fn rumba(ctx: &AppContext, command: RumbaCommand) -> Response {
    match &ctx.rumba {
        Some(link) => match link.send(command) {
            Ok(()) => Response::text(202, format!("rumba {command:?}")),
            Err(e) => Response::text(503, e.to_string()),
        },
        None => Response::text(503, "rumba link not available"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HealthMonitor;
    use crate::midi::controller::stubs::Recording;
    use crate::midi::controller::EmulateFlag;
    use crate::midi::model::Channel;
    use crate::midi::registry::model::RegistryLayout;
    use crate::midi::registry::shared::SharedRegistry;
    use crate::midi::registry::source::CsvFile;
    use crate::rumba::RumbaLink;
    use crate::scheduler::{EventsQueue, PumpScheduler};
    use std::time::Duration;

    fn context(name: &str, rumba: Option<RumbaLink>) -> (Arc<AppContext>, EventsQueue) {
        let upload_csv: PathBuf =
            std::env::temp_dir().join(format!("midipump-{name}-{}.csv", std::process::id()));
        let registry = SharedRegistry::new(RegistryLayout {
            base_offset: 36,
            capacity: 32,
            channel: Channel::default(),
        });
        let health = HealthMonitor::default();
        let (scheduler, queue) = PumpScheduler::make(
            registry,
            Arc::new(CsvFile::new(&upload_csv)),
            health.clone(),
            16,
        );
        let ctx = AppContext {
            scheduler,
            emulate: EmulateFlag::new(true),
            health,
            upload_csv,
            rumba,
            sse_interval: Duration::from_secs(1),
        };
        (Arc::new(ctx), queue)
    }

    fn get(path: &str, query: &[(&str, &str)]) -> Request {
        Request {
            method: "GET".to_string(),
            path: path.to_string(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    fn upload_request(body: &str) -> Request {
        Request {
            method: "POST".to_string(),
            path: "/upload".to_string(),
            body: body.as_bytes().to_vec(),
            ..Request::default()
        }
    }

    #[tokio::test]
    async fn upload_replaces_table_and_bad_upload_keeps_it() {
        let (ctx, _queue) = context("upload", None);

        let response = route(&upload_request("0,100\n1,250\n"), &ctx).await;
        assert_eq!(response.status, 200);
        assert_eq!(ctx.scheduler.snapshot().len(), 2);

        let response = route(&upload_request("x,100\n"), &ctx).await;
        assert_eq!(response.status, 422);
        assert_eq!(ctx.scheduler.snapshot().len(), 2);

        let _ = tokio::fs::remove_file(&ctx.upload_csv).await;
    }

    #[tokio::test]
    async fn empty_upload_keeps_table() {
        let (ctx, _queue) = context("upload-empty", None);
        route(&upload_request("0,100\n1,250\n"), &ctx).await;

        let response = route(&upload_request(""), &ctx).await;
        assert_eq!(response.status, 400);
        assert_eq!(route(&upload_request(" \n"), &ctx).await.status, 400);
        assert_eq!(ctx.scheduler.snapshot().len(), 2);
        assert_eq!(tokio::fs::read_to_string(&ctx.upload_csv).await.unwrap(), "0,100\n1,250\n");

        let _ = tokio::fs::remove_file(&ctx.upload_csv).await;
    }

    #[tokio::test]
    async fn chunked_upload_is_answered_without_touching_table() {
        let (ctx, _queue) = context("upload-chunked", None);
        route(&upload_request("0,100\n1,250\n"), &ctx).await;

        let (mut client, server) = tokio::io::duplex(4096);
        let (reader, mut writer) = tokio::io::split(server);
        let session = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                let mut reader = BufReader::new(reader);
                match http::read_request(&mut reader).await {
                    Err(RequestError::Rejected { status, message }) => {
                        Response::text(status, message).write_to(&mut writer).await
                    }
                    Ok(Some(request)) => route(&request, &ctx).await.write_to(&mut writer).await,
                    other => panic!("unexpected: {other:?}"),
                }
            }
        });

        client
            .write_all(b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nc\r\n0,100\n1,250\n\r\n0\r\n\r\n")
            .await
            .unwrap();
        session.await.unwrap().unwrap();

        let mut answer = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut answer)
            .await
            .unwrap();
        assert!(answer.starts_with("HTTP/1.1 411 Length Required\r\n"));
        assert_eq!(ctx.scheduler.snapshot().len(), 2);

        let _ = tokio::fs::remove_file(&ctx.upload_csv).await;
    }

    #[tokio::test]
    async fn reloads_never_see_a_partial_upload() {
        let (ctx, _queue) = context("upload-race", None);
        let short = "0,100\n1,250\n";
        let long = "0,100\n1,250\n2,300\n3,400\n";
        route(&upload_request(short), &ctx).await;

        let uploads = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                for round in 0..50 {
                    let table = if round % 2 == 0 { long } else { short };
                    assert_eq!(route(&upload_request(table), &ctx).await.status, 200);
                }
            }
        });
        for _ in 0..200 {
            if ctx.scheduler.reload().await.is_ok() {
                let durations: Vec<u64> = ctx
                    .scheduler
                    .snapshot()
                    .iter()
                    .map(|p| p.duration_ms)
                    .collect();
                assert!(durations == [100, 250] || durations == [100, 250, 300, 400]);
            }
            tokio::task::yield_now().await;
        }
        uploads.await.unwrap();

        let _ = tokio::fs::remove_file(&ctx.upload_csv).await;
    }

    #[tokio::test]
    async fn single_pump_validates_id() {
        let (ctx, queue) = context("single", None);
        route(&upload_request("0,100\n"), &ctx).await;

        assert_eq!(route(&get("/pumpSingle", &[("id", "x")]), &ctx).await.status, 400);
        assert_eq!(route(&get("/pumpSingle", &[("id", "7")]), &ctx).await.status, 404);
        assert_eq!(route(&get("/pumpSingle", &[("id", "0")]), &ctx).await.status, 200);
        assert_eq!(queue.0.len(), 1);

        let _ = tokio::fs::remove_file(&ctx.upload_csv).await;
    }

    #[tokio::test]
    async fn status_reports_pumps_health_and_emulate() {
        let (ctx, _queue) = context("status", None);
        route(&upload_request("3,40\n"), &ctx).await;

        let response = route(&get("/status", &[]), &ctx).await;
        assert_eq!(response.status, 200);
        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(json["emulate"], true);
        assert_eq!(json["pumps"][0]["pitch"], 39);
        assert_eq!(json["pumps"][0]["duration_ms"], 40);
        assert_eq!(json["health"]["last_reload"]["loaded"]["pumps"], 1);

        let _ = tokio::fs::remove_file(&ctx.upload_csv).await;
    }

    #[tokio::test]
    async fn emulate_toggle_and_unknown_routes() {
        let (ctx, _queue) = context("emulate", None);
        let mut toggle = get("/emulate", &[("enabled", "false")]);
        toggle.method = "POST".to_string();

        assert_eq!(route(&toggle, &ctx).await.status, 200);
        assert!(!ctx.emulate.is_enabled());
        assert_eq!(route(&get("/nowhere", &[]), &ctx).await.status, 404);
    }

    #[tokio::test]
    async fn rumba_routes_need_a_link() {
        let (ctx, _queue) = context("rumba-missing", None);
        assert_eq!(route(&get("/home", &[]), &ctx).await.status, 503);

        let recording = Recording::default();
        let (ctx, _queue) = context("rumba", Some(RumbaLink::start(recording.clone())));
        assert_eq!(route(&get("/move", &[]), &ctx).await.status, 202);
    }

    #[tokio::test]
    async fn event_stream_sends_status_frames() {
        let (ctx, _queue) = context("sse", None);
        let (mut client, mut server) = tokio::io::duplex(4096);
        let streaming = tokio::spawn({
            let ctx = ctx.clone();
            async move { stream_status(&mut server, &ctx).await }
        });

        let mut buf = vec![0; 4096];
        let mut received = String::new();
        while !received.contains("\n\n") || !received.contains("data: ") {
            let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert!(received.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/event-stream"));
        assert!(received.contains("data: {\"pumps\":[]"));

        drop(client);
        streaming.abort();
    }
}
