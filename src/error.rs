// =========================
// error.rs
// milter_engine エラー型定義
//
// 【このファイルで使う主なクレート】
// - thiserror: エラー列挙型のDisplay/From実装の自動生成
// - std: I/Oエラー（io::Error, io::ErrorKind）
//
// 【役割】
// - フレーミング・ペイロード・プロトコル・ケイパビリティ・I/O・設定の各エラーを1つの列挙型に集約
// - セッションを継続できるエラーかどうかの判定（is_fatal）
// =========================

use std::io;

/// milter_engine全体の結果型
pub type Result<T> = std::result::Result<T, Error>;

/// milter_engineのエラー種別
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 長さプレフィックスが不正・上限超過、またはフレーム途中でストリームが終了した
    #[error("framing error: {0}")]
    Framing(String),

    /// コマンド別ペイロードのデコード失敗
    #[error("malformed payload for command '{command}': {reason}")]
    MalformedPayload { command: char, reason: String },

    /// ステージ順序違反、スキップ交渉済みイベントの受信、バージョン不一致など
    #[error("protocol error: {0}")]
    Protocol(String),

    /// ネゴシエーションで合意していないアクションの使用
    #[error("action not negotiated: {0}")]
    UnsupportedAction(String),

    /// トランスポートのI/Oエラー（フレーム期限切れはTimedOutとしてここに入る）
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 相手側の切断、または無効化済みセッションの再利用
    #[error("connection closed")]
    Closed,

    /// 設定ファイルの読み込み・解釈エラー
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// ペイロード不正エラーを生成する補助関数
    pub fn malformed(command: u8, reason: impl Into<String>) -> Self {
        Error::MalformedPayload {
            command: command as char,
            reason: reason.into(),
        }
    }

    /// フレーム期限切れ（I/Oレベルのキャンセル）を表すエラー
    pub fn timed_out() -> Self {
        Error::Io(io::Error::new(io::ErrorKind::TimedOut, "frame deadline expired"))
    }

    /// セッションを破棄すべきエラーならtrue
    /// UnsupportedActionは書き込み前に検出されるため、セッションはそのまま使える
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::UnsupportedAction(_))
    }
}
