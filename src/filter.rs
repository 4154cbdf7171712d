// =========================
// filter.rs
// フィルタのコールバック契約
//
// 【このファイルで使う主なクレート】
// - async-trait: 非同期コールバックメソッドを持つトレイト
// - thiserror: FilterErrorのDisplay/Error実装
// - crate::modifier: コールバック中だけ有効な変更ハンドル
//
// 【役割】
// - Filter: イベントごとに1メソッド。既定実装はすべてContinue（必要なステージだけ実装すればよい）
// - FilterFactory: 接続ごとに独立したフィルタインスタンスを生成する
// - FilterError: コールバック失敗（既定でTempfail応答に変換）
// =========================

use async_trait::async_trait;

use crate::action::Action;
use crate::command::MacroStage;
use crate::message::ConnectInfo;
use crate::modifier::Modifier;

/// コールバックの結果型
pub type FilterResult = std::result::Result<Action, FilterError>;

/// コールバックの失敗
///
/// 既定ではTempfailとしてMTAへ返す。`with_verdict`で別の判定を指定できる。
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FilterError {
    message: String,
    verdict: Option<Action>,
}

impl FilterError {
    pub fn new(message: impl Into<String>) -> Self {
        FilterError {
            message: message.into(),
            verdict: None,
        }
    }

    /// 失敗しつつ判定は自分で決める
    pub fn with_verdict(verdict: Action, message: impl Into<String>) -> Self {
        FilterError {
            message: message.into(),
            verdict: Some(verdict),
        }
    }

    /// MTAへ返す判定
    pub fn verdict(&self) -> Action {
        self.verdict.clone().unwrap_or(Action::Tempfail)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<crate::error::Error> for FilterError {
    fn from(err: crate::error::Error) -> Self {
        FilterError::new(err.to_string())
    }
}

/// フィルタのコールバック（1接続に1インスタンス）
///
/// 各メソッドはイベントの内容と、そのコールバックの間だけ使える`Modifier`を受け取る。
/// 変更アクションは`body`（本文終了）の中でのみ送れる。
#[allow(unused_variables)]
#[async_trait]
pub trait Filter: Send {
    /// マクロ受信（応答なし）
    async fn macros(&mut self, stage: MacroStage, macros: &[(String, String)]) {}

    async fn connect(&mut self, info: &ConnectInfo, m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    async fn helo(&mut self, name: &str, m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    async fn mail_from(&mut self, from: &str, args: &[String], m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    async fn rcpt_to(&mut self, rcpt: &str, args: &[String], m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    async fn data(&mut self, m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    /// ヘッダ1行
    async fn header(&mut self, name: &str, value: &str, m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    /// ヘッダ終了（受信順のヘッダ一覧付き）
    async fn headers(&mut self, headers: &[(String, String)], m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    async fn body_chunk(&mut self, chunk: &[u8], m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    /// 本文終了。変更アクションはここで送る
    async fn body(&mut self, m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    async fn unknown(&mut self, command: &str, m: &mut Modifier<'_>) -> FilterResult {
        Ok(Action::Continue)
    }

    /// メッセージ処理の中断（応答なし）
    async fn abort(&mut self) {}

    /// 接続終了（応答なし）
    async fn quit(&mut self) {}
}

/// 接続ごとにフィルタを生成する
///
/// クロージャ`|| MyFilter::default()`もそのまま使える。
pub trait FilterFactory: Send + Sync + 'static {
    type Filter: Filter + 'static;

    fn create(&self) -> Self::Filter;
}

impl<F, T> FilterFactory for F
where
    F: Fn() -> T + Send + Sync + 'static,
    T: Filter + 'static,
{
    type Filter = T;

    fn create(&self) -> T {
        self()
    }
}
