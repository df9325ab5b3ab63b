use std::sync::Arc;

use clap::Parser;
use folioscan::{
    AuditLog,
    Catalog,
    DataDir,
    IndexEngine,
    Library,
    Orchestrator,
    SearchEvent,
    SearchRequest,
    SearchSession,
    SessionRegistry,
    Settings,
    audit::DEFAULT_USER,
    config::keys,
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, IndexArgs, SearchArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("FOLIOSCAN_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let catalog = Catalog::open(&data_dir.catalog_db())?;

    match cli.command {
        Command::List { json } => cmd_list(&catalog, json),
        Command::Status { json } => cmd_status(&data_dir, &catalog, json),
        Command::Config { action } => cmd_config(&catalog, action),
        command => {
            let settings = Settings::load(&catalog)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| {
                    Error::Config(format!("failed to start tokio runtime: {e}"))
                })?;

            runtime.block_on(async move {
                let services = Services::open(&data_dir, catalog, &settings)?;
                let result = match command {
                    Command::Index(args) => cmd_index(&services.library, &args),
                    Command::Remove { filename } => services
                        .library
                        .remove(&filename)
                        .map(|()| println!("Removed {filename}")),
                    Command::Rebuild => services.library.rebuild().map(|indexed| {
                        println!("Rebuilt index from {indexed} documents")
                    }),
                    Command::Search(args) => {
                        cmd_search(&services.registry, args).await
                    }
                    Command::Serve => {
                        serve(
                            Arc::clone(&services.registry),
                            settings.warmup_queries.clone(),
                            tokio::io::stdin(),
                            tokio::io::stdout(),
                        )
                        .await
                    }
                    Command::List { .. }
                    | Command::Status { .. }
                    | Command::Config { .. } => Ok(()),
                };
                services.shutdown().await;
                result
            })
        }
    }
}

/// Long-lived pieces shared by the commands that touch the index.
struct Services {
    library: Library,
    registry: Arc<SessionRegistry>,
    audit_task: JoinHandle<()>,
}

impl Services {
    /// Must be called from within the runtime: the audit writer is spawned
    /// here.
    fn open(data_dir: &DataDir, catalog: Catalog, settings: &Settings) -> Result<Self> {
        let engine = Arc::new(
            IndexEngine::open(&data_dir.index_dir()?)?
                .with_candidate_limit(settings.candidate_limit)
                .with_writer_memory(settings.writer_memory),
        );
        let (audit, audit_task) = AuditLog::spawn(&data_dir.audit_log()?);

        let library = Library::new(data_dir.documents_dir()?, catalog, Arc::clone(&engine))
            .with_audit(audit.clone());
        let registry = Arc::new(
            SessionRegistry::new(Orchestrator::new(engine).with_audit(audit))
                .with_timeout(settings.session_timeout)
                .with_capacity(settings.channel_capacity),
        );

        Ok(Self {
            library,
            registry,
            audit_task,
        })
    }

    /// Drop every audit handle and wait for the queued records to be written.
    async fn shutdown(self) {
        let Self {
            library,
            registry,
            audit_task,
        } = self;
        drop(library);
        drop(registry);
        if let Err(e) = audit_task.await {
            warn!("audit writer failed: {e}");
        }
    }
}

fn cmd_index(library: &Library, args: &IndexArgs) -> Result<()> {
    let user = args.user.as_deref().unwrap_or(DEFAULT_USER);
    let mut first_error = None;

    for path in &args.paths {
        match library.add_file(path, user) {
            Ok(record) => {
                println!("Indexed {} ({} pages)", record.filename, record.pages);
            }
            Err(e) => {
                eprintln!("Error: {}: {e}", path.display());
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn cmd_search(registry: &Arc<SessionRegistry>, args: SearchArgs) -> Result<()> {
    let mut session = registry.start(SearchRequest {
        query: args.query,
        session_id: None,
        user: args.user,
    })?;

    let mut failure = None;
    let mut matches = 0usize;
    while let Some(event) = session.events.recv().await {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
        }
        match event {
            SearchEvent::Result(result) => {
                matches += 1;
                if !args.json {
                    println!("{result}");
                }
            }
            SearchEvent::Completed => {
                if !args.json {
                    eprintln!("{matches} matches");
                }
            }
            SearchEvent::Error { message } => failure = Some(message),
        }
    }

    if let Err(e) = session.handle.await {
        return Err(Error::Search(format!("search task failed: {e}")));
    }
    match failure {
        Some(message) => Err(Error::Search(message)),
        None => Ok(()),
    }
}

/// One line read from stdin in `serve` mode.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServeMessage {
    Cancel { cancel: String },
    Search(SearchRequest),
}

/// One session event written to stdout in `serve` mode.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    session_id: &'a str,
    #[serde(flatten)]
    event: &'a SearchEvent,
}

/// Reply to a request that did not start or cancel a session.
///
/// Rejections are not session events and never carry a `sessionId`, so they
/// cannot land in the middle of a running session's stream.
#[derive(Serialize)]
#[serde(tag = "type", rename = "rejected", rename_all = "camelCase")]
struct Rejection<'a> {
    requested_session_id: Option<&'a str>,
    message: &'a str,
}

fn encode<T: Serialize>(line: &T) -> Option<String> {
    match serde_json::to_string(line) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!("failed to encode serve reply: {e}");
            None
        }
    }
}

fn envelope(session_id: &str, event: &SearchEvent) -> Option<String> {
    encode(&Envelope { session_id, event })
}

/// Stdio transport: JSON requests in, tagged JSON events out, one per line.
///
/// Sessions run concurrently and their events interleave on the output; a
/// single writer task owns it so lines never tear. Warmup queries run
/// alongside the first requests and are joined with the sessions on EOF.
async fn serve<R, W>(
    registry: Arc<SessionRegistry>,
    warmup: Vec<String>,
    input: R,
    output: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut tasks = JoinSet::new();
    if !warmup.is_empty() {
        let orchestrator = registry.orchestrator().clone();
        tasks.spawn_blocking(move || orchestrator.warmup(&warmup));
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = out_rx.recv().await {
            let written = async {
                output.write_all(line.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!("output closed: {e}");
                break;
            }
        }
    });

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            dispatch(&registry, line, &mut tasks, &out_tx);
        }
    }

    debug!(pending = tasks.len(), "input closed, waiting for sessions");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!("serve task failed: {e}");
        }
    }

    drop(out_tx);
    if let Err(e) = writer.await {
        warn!("output writer failed: {e}");
    }
    Ok(())
}

/// Handle one request line: start or cancel a session, or reject it.
fn dispatch(
    registry: &Arc<SessionRegistry>,
    line: &str,
    tasks: &mut JoinSet<()>,
    out: &mpsc::UnboundedSender<String>,
) {
    let (requested, message) = match serde_json::from_str::<ServeMessage>(line) {
        Ok(ServeMessage::Cancel { cancel }) => {
            if registry.cancel(&cancel) {
                return;
            }
            (Some(cancel), "no active session to cancel".to_string())
        }
        Ok(ServeMessage::Search(request)) => {
            let requested = request.session_id.clone();
            match registry.start(request) {
                Ok(session) => {
                    tasks.spawn(forward(session, out.clone()));
                    return;
                }
                Err(e) => (requested, e.to_string()),
            }
        }
        Err(e) => (None, format!("invalid request: {e}")),
    };

    debug!(session = ?requested, "rejected request: {message}");
    let rejection = Rejection {
        requested_session_id: requested.as_deref(),
        message: &message,
    };
    if let Some(line) = encode(&rejection) {
        let _ = out.send(line);
    }
}

/// Copy one session's events to the shared stdout writer.
async fn forward(mut session: SearchSession, out: mpsc::UnboundedSender<String>) {
    while let Some(event) = session.events.recv().await {
        let Some(line) = envelope(&session.id, &event) else {
            continue;
        };
        if out.send(line).is_err() {
            break;
        }
    }
    drop(session.events);

    match session.handle.await {
        Ok(outcome) => debug!(session = %session.id, state = ?outcome.state, "session done"),
        Err(e) => warn!(session = %session.id, "session task failed: {e}"),
    }
}

fn cmd_list(catalog: &Catalog, json: bool) -> Result<()> {
    let documents = catalog.list_documents()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&documents)?);
        return Ok(());
    }

    if documents.is_empty() {
        eprintln!("No documents stored.");
        return Ok(());
    }
    for doc in &documents {
        println!(
            "{}\t{} pages\t{} bytes\t{}",
            doc.filename, doc.pages, doc.bytes, doc.indexed_at
        );
    }
    Ok(())
}

fn cmd_status(data_dir: &DataDir, catalog: &Catalog, json: bool) -> Result<()> {
    let documents = catalog.list_documents()?.len();
    let pages = IndexEngine::open(&data_dir.index_dir()?)?.num_pages();

    if json {
        let status = serde_json::json!({
            "dataDir": data_dir.root().display().to_string(),
            "documents": documents,
            "pages": pages,
        });
        println!("{status}");
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Documents: {documents}");
        println!("Indexed pages: {pages}");
    }
    Ok(())
}

fn cmd_config(catalog: &Catalog, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let entries = Settings::load(catalog)?.entries();
            if json {
                let map: serde_json::Map<String, serde_json::Value> = entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
                    .collect();
                println!("{}", serde_json::Value::Object(map));
            } else {
                for (key, value) in entries {
                    println!("{key} = {value}");
                }
            }
        }
        ConfigAction::Set { key, value } => {
            Settings::default().apply(&key, &value)?;
            catalog.set_setting(&key, &value)?;
            println!("{key} = {value}");
        }
        ConfigAction::Unset { key } => {
            if !keys::ALL.contains(&key.as_str()) {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
            if catalog.remove_setting(&key)? {
                println!("Cleared {key}");
            } else {
                eprintln!("{key} was not set");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use folioscan::document::Document;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn serve_messages_parse() {
        let search: ServeMessage =
            serde_json::from_str(r#"{"query":"lot","user":"ana"}"#).unwrap();
        match search {
            ServeMessage::Search(request) => {
                assert_eq!(request.query, "lot");
                assert_eq!(request.user.as_deref(), Some("ana"));
            }
            other => panic!("expected search, got {other:?}"),
        }

        let cancel: ServeMessage = serde_json::from_str(r#"{"cancel":"s1"}"#).unwrap();
        assert!(matches!(cancel, ServeMessage::Cancel { cancel } if cancel == "s1"));

        assert!(serde_json::from_str::<ServeMessage>(r#"{"nope":1}"#).is_err());
    }

    #[test]
    fn envelope_flattens_event() {
        let line = envelope("s1", &SearchEvent::Completed).unwrap();
        assert_eq!(line, r#"{"sessionId":"s1","type":"completed"}"#);

        let line = envelope(
            "s2",
            &SearchEvent::Error {
                message: "bad".into(),
            },
        )
        .unwrap();
        assert_eq!(line, r#"{"sessionId":"s2","type":"error","message":"bad"}"#);
    }

    #[test]
    fn rejection_has_no_session_id() {
        let line = encode(&Rejection {
            requested_session_id: Some("s1"),
            message: "busy",
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"type":"rejected","requestedSessionId":"s1","message":"busy"}"#
        );
    }

    fn registry_with(engine: Arc<IndexEngine>, capacity: usize) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(Orchestrator::new(engine)).with_capacity(capacity))
    }

    fn engine_with(page: String) -> Arc<IndexEngine> {
        let engine = IndexEngine::open_in_ram().unwrap();
        engine
            .index_document(&Document::new("lots.txt", vec![page]))
            .unwrap();
        Arc::new(engine)
    }

    async fn run_serve(
        registry: Arc<SessionRegistry>,
        warmup: Vec<String>,
        input: &str,
    ) -> Vec<serde_json::Value> {
        let (server, mut client) = tokio::io::duplex(64 * 1024);
        let read = async {
            let mut out = String::new();
            client.read_to_string(&mut out).await.map(|_| out)
        };
        let (served, read) = tokio::join!(
            serve(registry, warmup, input.as_bytes(), server),
            read
        );
        served.unwrap();
        read.unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn rejections_stay_out_of_running_sessions() {
        let page = vec!["lot"; 2000].join("\n");
        let registry = registry_with(engine_with(page), 1);
        let input = concat!(
            r#"{"query":"lot","sessionId":"s1"}"#,
            "\n",
            r#"{"query":"lot","sessionId":"s1"}"#,
            "\n",
            r#"{"cancel":"gone"}"#,
            "\n",
        );

        let lines = run_serve(registry, Vec::new(), input).await;

        let s1: Vec<_> = lines.iter().filter(|l| l["sessionId"] == "s1").collect();
        assert_eq!(s1.len(), 2001);
        let terminal: Vec<_> = s1
            .iter()
            .enumerate()
            .filter(|(_, l)| l["type"] != "result")
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].0, s1.len() - 1);
        assert_eq!(terminal[0].1["type"], "completed");

        let rejected: Vec<_> = lines.iter().filter(|l| l["type"] == "rejected").collect();
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|l| l.get("sessionId").is_none()));
        assert_eq!(rejected[0]["requestedSessionId"], "s1");
        assert!(
            rejected[0]["message"]
                .as_str()
                .is_some_and(|m| m.contains("already active"))
        );
        assert_eq!(rejected[1]["requestedSessionId"], "gone");
    }

    #[tokio::test]
    async fn late_cancel_is_rejected_after_completion() {
        let registry = registry_with(engine_with("the lot".to_string()), 16);
        let lines = run_serve(
            Arc::clone(&registry),
            Vec::new(),
            concat!(r#"{"query":"lot","sessionId":"s1"}"#, "\n"),
        )
        .await;
        assert_eq!(lines.last().unwrap()["type"], "completed");

        let lines =
            run_serve(registry, Vec::new(), concat!(r#"{"cancel":"s1"}"#, "\n")).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "rejected");
        assert!(lines[0].get("sessionId").is_none());
    }

    #[tokio::test]
    async fn warmup_is_joined_before_returning() {
        let engine = engine_with("the lot".to_string());
        let registry = registry_with(Arc::clone(&engine), 16);
        let warmup = vec!["lot".to_string(); 50];

        let lines = run_serve(Arc::clone(&registry), warmup, "").await;

        assert!(lines.is_empty());
        assert!(registry.active().is_empty());
        // Only the test and the registry's orchestrator still hold the engine.
        assert_eq!(Arc::strong_count(&engine), 2);
    }
}
