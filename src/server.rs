// =========================
// server.rs
// フィルタ側サーバー: 接続受付と接続ごとのディスパッチャ
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期TCPサーバ・ブロードキャスト・タスク生成（net::TcpListener, sync::broadcast, spawn, select!）
// - crate::frame: FrameStream（フレーム送受信・期限）
// - crate::filter: Filter/FilterFactory（利用者のコールバック）
// - crate::modifier: コールバックへ渡す変更ハンドル
// - crate::printdaytimeln! / eprintdaytimeln!: タイムスタンプ付きログ出力マクロ
//
// 【役割】
// - 1接続1タスク。接続ごとに独立したフィルタ・ステージ・マクロ表を持つ
// - 応答側としてのオプション交渉 → イベント受信 → フィルタ呼び出し → 判定送信
// - 省略ステップの受信・順序違反・不正フレームで接続を終了
// - close()で受付ループと全接続へ終了通知（ブロードキャスト）
// =========================

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::action::Action;
use crate::command::Command;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterFactory};
use crate::flags::{ActionFlags, ProtocolFlags};
use crate::frame::FrameStream;
use crate::macros::MacroTable;
use crate::message::{Event, Reply};
use crate::modifier::Modifier;
use crate::negotiate::{Capabilities, OptNeg};
use crate::stage::StageTracker;

// 受付エラーが続いたときの待ち時間（連続回数で倍、上限1秒）
fn accept_backoff(failures: u32) -> Duration {
    let ms = 10u64.saturating_mul(1u64 << failures.min(7));
    Duration::from_millis(ms.min(1000))
}

/// Milterフィルタサーバー
pub struct Server<F: FilterFactory> {
    factory: Arc<F>,
    config: Config,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl<F: FilterFactory> Server<F> {
    /// # 引数
    /// - `factory`: 接続ごとにフィルタを生成する
    /// - `config`: 交渉フラグ（actions/protocol）・フレーム上限・期限
    pub fn new(factory: F, config: Config) -> Self {
        // 終了通知用ブロードキャストチャネル
        let (shutdown, _) = broadcast::channel::<()>(100);
        Server {
            factory: Arc::new(factory),
            config,
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 接続受付ループ（close()まで戻らない）
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut failures = 0u32;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => {
                            failures = 0;
                            pair
                        }
                        Err(e) => {
                            // EMFILE等は即再試行しても同じエラーになる
                            let wait = accept_backoff(failures);
                            failures = failures.saturating_add(1);
                            crate::eprintdaytimeln!("接続受付エラー: {} ({}ms後に再試行)", e, wait.as_millis());
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                    };
                    crate::printdaytimeln!("接続: {}", addr);
                    let dispatcher = Dispatcher::new(
                        stream,
                        self.factory.create(),
                        &self.config,
                        addr.to_string(),
                    );
                    let shutdown_rx = self.shutdown.subscribe(); // 接続用レシーバ
                    tokio::spawn(async move {
                        let _ = dispatcher.run(shutdown_rx).await;
                    });
                }
                _ = shutdown_rx.recv() => {
                    crate::printdaytimeln!("終了通知: 接続受付を停止");
                    return Ok(());
                }
            }
        }
    }

    /// 任意の双方向ストリームで1接続を処理する（呼び出し元のタスクで実行）
    pub async fn handle_connection<S>(&self, stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let shutdown_rx = self.shutdown.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Dispatcher::new(stream, self.factory.create(), &self.config, peer.to_string())
            .run(shutdown_rx)
            .await
    }

    /// 受付ループと全接続を終了させる
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }
}

// 1接続分の状態（他の接続とは共有しない）
struct Dispatcher<S, F> {
    io: FrameStream<S>,
    filter: F,
    actions: ActionFlags,
    protocol: ProtocolFlags,
    caps: Option<Capabilities>,
    stages: StageTracker,
    macros: MacroTable,
    headers: Vec<(String, String)>,
    peer: String,
}

impl<S, F> Dispatcher<S, F>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    F: Filter,
{
    fn new(stream: S, filter: F, config: &Config, peer: String) -> Self {
        Dispatcher {
            io: FrameStream::new(stream, config.max_payload, config.frame_timeout()),
            filter,
            actions: config.actions,
            protocol: config.protocol,
            caps: None,
            stages: StageTracker::new(ProtocolFlags::empty()),
            macros: MacroTable::new(),
            headers: Vec::new(),
            peer,
        }
    }

    /// 受信 → ディスパッチ → 応答 を切断・Quit・終了通知まで繰り返す
    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let received = tokio::select! {
                res = self.io.recv() => res,
                _ = shutdown_rx.recv() => { // サーバー終了通知
                    crate::printdaytimeln!("終了通知により切断: {}", self.peer);
                    return Ok(());
                }
            };
            let frame = match received {
                Ok(frame) => frame,
                Err(Error::Closed) => {
                    crate::printdaytimeln!("切断: {}", self.peer);
                    self.filter.quit().await;
                    return Ok(());
                }
                Err(e) => {
                    crate::eprintdaytimeln!("受信エラー: {}: {}", self.peer, e);
                    return Err(e);
                }
            };
            crate::printdaytimeln!(
                "コマンド受信: {} (0x{:02X}) size={} from {}",
                Command::from_u8(frame.command).map_or("UNKNOWN", |c| c.as_str()),
                frame.command,
                frame.wire_len(),
                self.peer
            );
            let event = match Event::from_frame(&frame) {
                Ok(event) => event,
                Err(e) => {
                    crate::eprintdaytimeln!("不正フレーム: {}: {}", self.peer, e);
                    return Err(e);
                }
            };
            match self.dispatch(event).await {
                Ok(true) => {}
                Ok(false) => {
                    crate::printdaytimeln!("QUIT: {}", self.peer);
                    return Ok(());
                }
                Err(e) => {
                    crate::eprintdaytimeln!("接続終了: {}: {}", self.peer, e);
                    return Err(e);
                }
            }
        }
    }

    // 戻り値falseは会話終了（Quit）
    async fn dispatch(&mut self, event: Event) -> Result<bool> {
        let caps = match self.caps {
            Some(caps) => caps,
            None => {
                return match event {
                    Event::OptNeg(offer) => {
                        self.negotiate(offer).await?;
                        Ok(true)
                    }
                    other => Err(Error::Protocol(format!(
                        "{} before option negotiation",
                        other.command().as_str()
                    ))),
                };
            }
        };
        match event {
            Event::OptNeg(_) => Err(Error::Protocol(
                "option negotiation repeated".to_string(),
            )),
            Event::Macro { stage, macros } => {
                self.macros.set(stage, macros);
                if let Some(macros) = self.macros.stage(stage) {
                    self.filter.macros(stage, macros).await;
                }
                Ok(true)
            }
            Event::Abort => {
                self.filter.abort().await;
                self.stages.abort();
                self.reset_message();
                Ok(true)
            }
            Event::Quit => {
                self.filter.quit().await;
                Ok(false)
            }
            event => {
                self.stage_event(caps, event).await?;
                Ok(true)
            }
        }
    }

    async fn negotiate(&mut self, offer: OptNeg) -> Result<()> {
        let reply = OptNeg::respond(&offer, self.actions, self.protocol)?;
        self.io.send(&Reply::OptNeg(reply).to_frame()).await?;
        let caps = Capabilities {
            version: reply.version,
            actions: reply.actions,
            protocol: reply.protocol,
        };
        crate::printdaytimeln!(
            "交渉完了: {} version={} actions={} protocol={}",
            self.peer,
            caps.version,
            caps.actions,
            caps.protocol
        );
        self.stages = StageTracker::new(caps.protocol);
        self.caps = Some(caps);
        Ok(())
    }

    // ステージ付きイベント: 検査 → フィルタ呼び出し → 判定送信
    async fn stage_event(&mut self, caps: Capabilities, event: Event) -> Result<()> {
        let command = event.command();
        if caps.skips(command) {
            return Err(Error::Protocol(format!(
                "{} received although negotiated away",
                command.as_str()
            )));
        }
        if command == Command::Unknown {
            if !self.stages.is_connected() {
                return Err(Error::Protocol("UNKNOWN before CONNECT".to_string()));
            }
        } else {
            self.stages.advance(command)?;
        }
        if let Event::Header { name, value } = &event {
            self.headers.push((name.clone(), value.clone()));
        }

        let verdict = self.invoke(caps, &event).await?;
        let verdict = self.sanitize(caps, command, verdict);
        if caps.no_reply(command) {
            if !verdict.is_continue() {
                crate::printdaytimeln!(
                    "無応答ステップのため判定を破棄: {} {} from {}",
                    command.as_str(),
                    verdict,
                    self.peer
                );
            }
        } else {
            self.io.send(&Reply::Action(verdict).to_frame()).await?;
        }
        if command == Command::EndOfBody {
            self.reset_message();
        }
        Ok(())
    }

    // フィルタのメソッドを呼ぶ。Modifierはこの呼び出しの間だけ有効
    async fn invoke(&mut self, caps: Capabilities, event: &Event) -> Result<Action> {
        let at_end_of_body = matches!(event, Event::EndOfBody);
        let mut m = Modifier::new(&mut self.io, caps, &self.macros, at_end_of_body);
        let filter = &mut self.filter;
        let result = match event {
            Event::Connect(info) => filter.connect(info, &mut m).await,
            Event::Helo(name) => filter.helo(name, &mut m).await,
            Event::Mail { sender, args } => filter.mail_from(sender, args, &mut m).await,
            Event::Rcpt { recipient, args } => filter.rcpt_to(recipient, args, &mut m).await,
            Event::Data => filter.data(&mut m).await,
            Event::Header { name, value } => filter.header(name, value, &mut m).await,
            Event::EndOfHeaders => filter.headers(&self.headers, &mut m).await,
            Event::BodyChunk(chunk) => filter.body_chunk(chunk, &mut m).await,
            Event::EndOfBody => filter.body(&mut m).await,
            Event::Unknown(command) => filter.unknown(command, &mut m).await,
            other => {
                return Err(Error::Protocol(format!(
                    "{} is not a stage event",
                    other.command().as_str()
                )))
            }
        };
        if m.is_broken() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "modification could not be written",
            )));
        }
        Ok(match result {
            Ok(action) => action,
            Err(e) => {
                let verdict = e.verdict();
                crate::eprintdaytimeln!("フィルタエラー: {}: {} -> {}", self.peer, e, verdict);
                verdict
            }
        })
    }

    // そのステージで返せない判定を置き換える
    fn sanitize(&self, caps: Capabilities, command: Command, verdict: Action) -> Action {
        let allowed = caps.protocol.contains(verdict.required_protocol());
        match verdict {
            Action::Skip if command != Command::Body || !allowed => {
                crate::printdaytimeln!(
                    "SKIPは使えないためCONTINUEに置換: {} from {}",
                    command.as_str(),
                    self.peer
                );
                Action::Continue
            }
            Action::Quarantine(_) if command != Command::EndOfBody => {
                crate::printdaytimeln!(
                    "QUARANTINEは本文終了でのみ有効のためTEMPFAILに置換: {} from {}",
                    command.as_str(),
                    self.peer
                );
                Action::Tempfail
            }
            other => other,
        }
    }

    // メッセージ単位の状態を破棄（Abort・本文終了）
    fn reset_message(&mut self) {
        self.headers.clear();
        self.macros.clear_message();
    }
}
