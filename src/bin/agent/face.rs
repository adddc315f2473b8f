use anyhow::{Result, bail};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

/// What the chat page hears about over SSE.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    User { text: String },
    Assistant { text: String },
    Thinking,
    /// A new screenshot is on disk; `page` is the snapshot it belongs to.
    Screenshot { page: u64 },
    TurnError { message: String },
    Ready,
    Closed,
}

impl AgentEvent {
    fn to_sse_event(&self) -> Event {
        let (name, data) = match self {
            AgentEvent::User { text } => ("user", json!({ "text": text })),
            AgentEvent::Assistant { text } => ("assistant", json!({ "text": text })),
            AgentEvent::Thinking => ("thinking", json!({})),
            AgentEvent::Screenshot { page } => ("screenshot", json!({ "page": page })),
            AgentEvent::TurnError { message } => ("turn_error", json!({ "message": message })),
            AgentEvent::Ready => ("ready", json!({})),
            AgentEvent::Closed => ("closed", json!({})),
        };
        Event::default().event(name).data(data.to_string())
    }
}

struct AppState {
    cmd_tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<AgentEvent>,
    screenshot: PathBuf,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Binds the first free port in 3000..3010 and serves the chat page. Returns
/// the command receiver and the event sender the turn loop talks through.
pub async fn start_server(
    screenshot: PathBuf,
) -> Result<(mpsc::Receiver<String>, broadcast::Sender<AgentEvent>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(1);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
        screenshot,
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .route("/screenshot", get(screenshot_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for port in 3000..3010 {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let Some((listener, port)) = bound else {
        bail!("no free port in 3000-3009; is another agent still running?");
    };

    info!("chat UI at http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "UI server stopped");
        }
    });

    Ok((cmd_rx, event_tx))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> StatusCode {
    debug!(command = %payload.command, "command received");
    match state.cmd_tx.send(payload.command).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::GONE,
    }
}

async fn screenshot_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::fs::read(&state.screenshot).await {
        Ok(png) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            png,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Live Navigation</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 16px 24px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 18px; font-weight: 600; color: #fff; }
  header .hint { font-size: 13px; color: #666; margin-left: auto; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  .dot.busy { background: #f59e0b; }
  .dot.closed { background: #ef4444; }
  .main { flex: 1; display: flex; gap: 16px; padding: 16px 24px; overflow: hidden; }
  .chat { width: 420px; display: flex; flex-direction: column; gap: 12px; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 8px; }
  .msg { padding: 10px 14px; border-radius: 8px; font-size: 14px; line-height: 1.5; }
  .msg.user { background: #1a1a2e; border-left: 3px solid #6366f1; }
  .msg.assistant {
    background: #111118;
    border-left: 3px solid #3b82f6;
    font-family: 'Cascadia Code', 'Fira Code', monospace;
    font-size: 13px;
  }
  .msg.thinking { background: #111118; border-left: 3px solid #f59e0b; color: #fcd34d; }
  .msg.error { background: #1a0a0a; border-left: 3px solid #ef4444; color: #fca5a5; }
  .preview { flex: 1; background: #111118; border-radius: 8px; overflow: auto; }
  .preview img { width: 100%; display: block; }
  .input-area { display: flex; gap: 8px; }
  #cmd {
    flex: 1;
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 10px 14px;
    color: #fff;
    font-size: 15px;
    outline: none;
  }
  #cmd:focus { border-color: #6366f1; }
  #cmd:disabled { opacity: 0.5; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 10px 18px;
    font-weight: 600;
    cursor: pointer;
  }
  button:disabled { background: #333; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>Live Navigation</h1>
    <span class="hint">"Continue" lets the model act again, "Quit" ends the session</span>
  </header>
  <div class="main">
    <div class="chat">
      <div id="log"></div>
      <div class="input-area">
        <input type="text" id="cmd" placeholder="Instruct the navigator..." autofocus />
        <button id="send" onclick="send()">Send</button>
      </div>
    </div>
    <div class="preview"><img id="shot" alt=""></div>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const sendBtn = document.getElementById('send');
  const dot = document.getElementById('status-dot');
  const shot = document.getElementById('shot');
  let busy = false;
  let thinking = null;

  function esc(s) { return s.replace(/&/g, '&amp;').replace(/</g, '&lt;'); }

  function add(cls, html) {
    const div = document.createElement('div');
    div.className = 'msg ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
    return div;
  }

  function clearThinking() {
    if (thinking) { thinking.remove(); thinking = null; }
  }

  function setBusy(b) {
    busy = b;
    cmd.disabled = b;
    sendBtn.disabled = b;
    dot.className = b ? 'dot busy' : 'dot';
    if (!b) cmd.focus();
  }

  async function send() {
    const text = cmd.value.trim();
    if (!text || busy) return;
    cmd.value = '';
    setBusy(true);
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command: text}),
    });
  }

  cmd.addEventListener('keydown', e => { if (e.key === 'Enter') send(); });

  const es = new EventSource('/events');
  es.addEventListener('user', e => add('user', esc(JSON.parse(e.data).text)));
  es.addEventListener('assistant', e => {
    clearThinking();
    add('assistant', esc(JSON.parse(e.data).text));
  });
  es.addEventListener('thinking', () => { thinking = add('thinking', 'Thinking...'); });
  es.addEventListener('screenshot', () => { shot.src = '/screenshot?t=' + Date.now(); });
  es.addEventListener('turn_error', e => {
    clearThinking();
    add('error', esc(JSON.parse(e.data).message));
  });
  es.addEventListener('ready', () => setBusy(false));
  es.addEventListener('closed', () => {
    clearThinking();
    add('thinking', 'Session closed.');
    setBusy(true);
    dot.className = 'dot closed';
  });
</script>
</body>
</html>
"##;
