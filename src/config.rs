// =========================
// config.rs
// milter_engine 設定管理モジュール
//
// 【このファイルで使う主なクレート】
// - std: ファイル入出力（fs::read_to_string）、文字列処理（lines, trim, parse）、時間（Duration）
// - chrono-tz: ログ用タイムゾーン名の解釈（Tz）
// - crate::flags: Actions/Protocol行のフラグ名解釈
//
// 【役割】
// - サーバー設定（Listenアドレス、クライアントタイムアウト、フレーム上限、交渉フラグ等）の読み込み・保持
// - 設定ファイル(MilterEngine.conf)からConfig構造体を生成
// =========================

use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::flags::{ActionFlags, ProtocolFlags};
use crate::frame::DEFAULT_MAX_PAYLOAD;

/// 既定の設定ファイル名
pub const DEFAULT_CONFIG_FILE: &str = "MilterEngine.conf";

/// サーバー・セッション設定
/// - address: サーバー待受アドレス（例: [::]:8898）
/// - client_timeout: 1フレーム送受信あたりの期限秒（0なら無期限）
/// - max_payload: 受け付ける最大フレームペイロード長
/// - actions: フィルタ側として要求する変更アクション
/// - protocol: フィルタ側として省略したいプロトコルステップ
/// - log_timezone: ログのタイムスタンプに使うタイムゾーン
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub address: String,
    pub client_timeout: u64,
    pub max_payload: usize,
    pub actions: ActionFlags,
    pub protocol: ProtocolFlags,
    pub log_timezone: Tz,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: "[::]:8898".to_string(), // IPv4/IPv6デュアルスタック8898番ポート
            client_timeout: 30,
            max_payload: DEFAULT_MAX_PAYLOAD,
            actions: ActionFlags::ADD_HEADERS | ActionFlags::CHANGE_HEADERS,
            protocol: ProtocolFlags::empty(),
            log_timezone: chrono_tz::Asia::Tokyo,
        }
    }
}

impl Config {
    /// フレーム送受信の期限（0秒は期限なし）
    pub fn frame_timeout(&self) -> Option<Duration> {
        if self.client_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.client_timeout))
        }
    }

    /// 設定テキストを解釈してConfigを生成
    ///
    /// # 説明
    /// - `Listen <アドレス/ポート>`: ポートのみなら[::]:<port>
    /// - `Client_timeout <秒>`
    /// - `Max_payload <バイト>`
    /// - `Actions <名前,名前,...>` / `Protocol <名前,名前,...>`
    /// - `Log_timezone <IANA名>`
    /// - 未知のキーと#で始まる行は無視
    pub fn parse(text: &str) -> Result<Config> {
        let mut config = Config::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("Listen ") {
                let addr = rest.trim();
                config.address = if addr.contains(':') {
                    addr.to_string() // IP:Port形式（例: 192.168.0.1:4000）
                } else {
                    format!("[::]:{}", addr) // ポートのみ指定時
                };
            } else if let Some(rest) = line.strip_prefix("Client_timeout ") {
                config.client_timeout = parse_number(rest, "Client_timeout")?;
            } else if let Some(rest) = line.strip_prefix("Max_payload ") {
                let size: usize = parse_number(rest, "Max_payload")?;
                if size == 0 {
                    return Err(Error::Config("Max_payload must be positive".to_string()));
                }
                config.max_payload = size;
            } else if let Some(rest) = line.strip_prefix("Actions ") {
                config.actions = ActionFlags::parse_list(rest)?;
            } else if let Some(rest) = line.strip_prefix("Protocol ") {
                config.protocol = ProtocolFlags::parse_list(rest)?;
            } else if let Some(rest) = line.strip_prefix("Log_timezone ") {
                config.log_timezone = rest
                    .trim()
                    .parse::<Tz>()
                    .map_err(|e| Error::Config(format!("Log_timezone: {}", e)))?;
            }
        }
        Ok(config)
    }
}

// 数値設定の解釈（失敗時はキー名付きのConfigエラー）
fn parse_number<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| Error::Config(format!("{}: not a number: {}", key, raw.trim())))
}

/// 設定ファイルからConfigを生成
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Config::parse(&text)
}
