// =========================
// session.rs
// MTA側からフィルタとの1会話を進めるクライアントセッション
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期I/O（AsyncRead/AsyncWrite）、本文の読み込み
// - crate::frame: FrameStream（フレーム送受信・期限）
// - crate::negotiate: 要求側としてのオプション交渉
// - crate::stage: ステージ順序の検査
// - crate::printdaytimeln!: タイムスタンプ付きログ出力マクロ
//
// 【役割】
// - 交渉 → Connect → Helo → Mail → Rcpt* → (Data) → Header* → EOH → Body* → EOB の送信と判定受信
// - 本文のチャンク分割送信、本文終了後の変更アクション収集
// - 省略ステップ（NO_*）・無応答ステップ（NO_REPLY_*）の扱い
// - 致命的な失敗の後はセッションを使用不可にする
// =========================

use tokio::io::{AsyncRead, AsyncWrite};

use crate::action::{Action, ModifyAction};
use crate::command::{Command, MacroStage};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flags::{ActionFlags, ProtocolFlags};
use crate::frame::{fill_chunk, FrameStream, DEFAULT_MAX_PAYLOAD, MAX_BODY_CHUNK};
use crate::message::{AddressFamily, ConnectInfo, Event, Reply};
use crate::negotiate::{Capabilities, OptNeg};
use crate::stage::StageTracker;

/// フィルタとの1接続分の会話（MTA側）
///
/// 1呼び出しずつ順番に使う。順序違反・I/Oエラー・不正な応答の後は
/// 以降の呼び出しがすべて`Error::Closed`になる。
pub struct ClientSession<S> {
    io: FrameStream<S>,
    caps: Capabilities,
    stages: StageTracker,
    broken: bool,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// 既定のフレーム上限・期限なしで交渉する
    ///
    /// # 引数
    /// - `actions`: MTAとして許可する変更アクション
    /// - `protocol`: MTAとして省略を認めるステップ
    pub async fn negotiate(stream: S, actions: ActionFlags, protocol: ProtocolFlags) -> Result<Self> {
        let io = FrameStream::new(stream, DEFAULT_MAX_PAYLOAD, None);
        Self::handshake(io, actions, protocol).await
    }

    /// 設定（フレーム上限・期限・交渉フラグ）に従って交渉する
    pub async fn negotiate_with(stream: S, config: &Config) -> Result<Self> {
        let io = FrameStream::new(stream, config.max_payload, config.frame_timeout());
        Self::handshake(io, config.actions, config.protocol).await
    }

    async fn handshake(
        mut io: FrameStream<S>,
        actions: ActionFlags,
        protocol: ProtocolFlags,
    ) -> Result<Self> {
        let proposal = OptNeg::propose(actions, protocol);
        io.send(&Event::OptNeg(proposal).to_frame()).await?;
        let frame = io.recv().await?;
        let reply = match Reply::from_frame(&frame)? {
            Reply::OptNeg(reply) => reply,
            other => {
                return Err(Error::Protocol(format!(
                    "expected option negotiation, got {}",
                    other.code().as_str()
                )))
            }
        };
        let caps = OptNeg::accept(&proposal, &reply)?;
        crate::printdaytimeln!(
            "交渉完了: version={} actions={} protocol={}",
            caps.version,
            caps.actions,
            caps.protocol
        );
        Ok(ClientSession {
            io,
            caps,
            stages: StageTracker::new(caps.protocol),
            broken: false,
        })
    }

    /// 合意済みケイパビリティ
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// まだ使えるか（致命的な失敗が起きていないか）
    pub fn is_usable(&self) -> bool {
        !self.broken
    }

    /// マクロ定義を送る（応答なし）
    pub async fn macros(&mut self, stage: MacroStage, macros: &[(&str, &str)]) -> Result<()> {
        self.ensure_usable()?;
        let event = Event::Macro {
            stage,
            macros: macros
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let result = self.io.send(&event.to_frame()).await;
        self.track(result)
    }

    /// SMFIC_CONNECT
    pub async fn conn(
        &mut self,
        hostname: &str,
        family: AddressFamily,
        port: u16,
        address: &str,
    ) -> Result<Action> {
        self.step(Event::Connect(ConnectInfo {
            hostname: hostname.to_string(),
            family,
            port,
            address: address.to_string(),
        }))
        .await
    }

    pub async fn helo(&mut self, name: &str) -> Result<Action> {
        self.step(Event::Helo(name.to_string())).await
    }

    /// MAIL FROM（ESMTP引数付き）
    pub async fn mail(&mut self, sender: &str, args: &[&str]) -> Result<Action> {
        self.step(Event::Mail {
            sender: sender.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
        .await
    }

    /// RCPT TO（ESMTP引数付き）
    pub async fn rcpt(&mut self, recipient: &str, args: &[&str]) -> Result<Action> {
        self.step(Event::Rcpt {
            recipient: recipient.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
        .await
    }

    pub async fn data(&mut self) -> Result<Action> {
        self.step(Event::Data).await
    }

    /// ヘッダ1行
    pub async fn header(&mut self, name: &str, value: &str) -> Result<Action> {
        self.step(Event::Header {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    pub async fn end_of_headers(&mut self) -> Result<Action> {
        self.step(Event::EndOfHeaders).await
    }

    /// ヘッダ一式を送ってからヘッダ終了を送る
    /// Continue以外の判定が返った時点でその判定を返す
    pub async fn headers(&mut self, headers: &[(&str, &str)]) -> Result<Action> {
        for (name, value) in headers {
            let action = self.header(name, value).await?;
            if !action.is_continue() {
                return Ok(action);
            }
        }
        self.end_of_headers().await
    }

    /// 未知のSMTPコマンド
    pub async fn unknown(&mut self, command: &str) -> Result<Action> {
        self.step(Event::Unknown(command.to_string())).await
    }

    /// 本文を送り、変更アクションと最終判定を受け取る
    ///
    /// # 説明
    /// - readerを終端まで読み、min(65535, フレーム上限)バイトずつ本文チャンクとして送信
    /// - Skip応答で残りのチャンクを打ち切り、本文終了へ進む
    /// - チャンクにContinue/Skip以外の判定が返ればその判定を返す（変更アクションなし）
    /// - 本文終了後は変更アクションを受信順に集め、最終判定で終わる
    pub async fn body<R>(&mut self, body: R) -> Result<(Vec<ModifyAction>, Action)>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ensure_usable()?;
        let result = self.body_inner(body).await;
        self.track(result)
    }

    async fn body_inner<R>(&mut self, mut body: R) -> Result<(Vec<ModifyAction>, Action)>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.stages.check(Command::EndOfBody)?;
        if !self.caps.skips(Command::Body) {
            let mut buf = vec![0u8; MAX_BODY_CHUNK.min(self.io.max_payload())];
            loop {
                let n = fill_chunk(&mut body, &mut buf).await?;
                if n == 0 {
                    break;
                }
                let action = self
                    .exchange(Event::BodyChunk(buf[..n].to_vec()))
                    .await?;
                match action {
                    Action::Continue => {}
                    Action::Skip => break, // 残りの本文は不要
                    other => return Ok((Vec::new(), other)),
                }
                if n < buf.len() {
                    break; // 終端に到達
                }
            }
        }

        self.stages.advance(Command::EndOfBody)?;
        self.io.send(&Event::EndOfBody.to_frame()).await?;
        let mut modifications = Vec::new();
        loop {
            let frame = self.io.recv().await?;
            match Reply::from_frame(&frame)? {
                Reply::Modify(modify) => {
                    if self.caps.check_action(modify.required_flag()).is_err() {
                        return Err(Error::Protocol(format!(
                            "filter sent {} without negotiating {}",
                            modify.reply_code().as_str(),
                            modify.required_flag()
                        )));
                    }
                    modifications.push(modify);
                }
                Reply::Progress => continue,
                Reply::Action(action) => return Ok((modifications, action)),
                Reply::OptNeg(_) => {
                    return Err(Error::Protocol(
                        "option negotiation reply after end of body".to_string(),
                    ))
                }
            }
        }
    }

    /// 現在のメッセージを中断し、次のMAIL FROMを送れる状態に戻す
    pub async fn abort(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let result = self.io.send(&Event::Abort.to_frame()).await;
        if result.is_ok() {
            self.stages.abort();
        }
        self.track(result)
    }

    /// Quitを送って接続を閉じる
    pub async fn close(mut self) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        self.io.send(&Event::Quit.to_frame()).await?;
        self.io.shutdown().await
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // 致命的なエラーならセッションを使用不可にする
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                crate::printdaytimeln!("セッション終了: {}", err);
                self.broken = true;
            }
        }
        result
    }

    // 順序検査 → 送信 → 判定受信
    async fn step(&mut self, event: Event) -> Result<Action> {
        self.ensure_usable()?;
        let result = self.exchange(event).await;
        self.track(result)
    }

    async fn exchange(&mut self, event: Event) -> Result<Action> {
        let command = event.command();
        if command == Command::Unknown {
            // 未知コマンドは接続後ならどのステージでも送れる
            if !self.stages.is_connected() {
                return Err(Error::Protocol("UNKNOWN before CONNECT".to_string()));
            }
        } else {
            self.stages.advance(command)?;
        }
        if self.caps.skips(command) {
            return Ok(Action::Continue); // 交渉で省略されたステップは送らない
        }
        self.io.send(&event.to_frame()).await?;
        if self.caps.no_reply(command) {
            return Ok(Action::Continue);
        }
        self.read_action(command).await
    }

    // 1ステージ分の判定を受信
    async fn read_action(&mut self, command: Command) -> Result<Action> {
        loop {
            let frame = self.io.recv().await?;
            match Reply::from_frame(&frame)? {
                Reply::Action(Action::Skip) if command != Command::Body => {
                    return Err(Error::Protocol(format!(
                        "skip is only valid for body chunks, got it for {}",
                        command.as_str()
                    )));
                }
                Reply::Action(action) => return Ok(action),
                Reply::Progress => continue,
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} reply to {}",
                        other.code().as_str(),
                        command.as_str()
                    )))
                }
            }
        }
    }
}
