// =========================
// action.rs
// フィルタ応答（判定）と変更アクションの型定義
//
// 【このファイルで使う主なクレート】
// - std: フォーマット
// - crate::command: 応答コード（ReplyCode）
// - crate::flags: 各変更アクションに必要なActionFlags
//
// 【役割】
// - Action: 各ステージを終わらせる判定（Continue, Reject, Quarantine, ...）
// - ModifyAction: 本文終了時に判定より前に送られるメッセージ変更コマンド
// =========================

use std::fmt;

use crate::command::ReplyCode;
use crate::flags::{ActionFlags, ProtocolFlags};

/// ステージの判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// 次のステージへ進む
    Continue,
    /// メッセージ（または接続）を受理し、以降のフィルタ処理を行わない
    Accept,
    /// 拒否（5xx）
    Reject,
    /// 受理した上で破棄
    Discard,
    /// 一時エラー（4xx）
    Tempfail,
    /// 残りの本文チャンクを送らなくてよい（本文チャンクへの応答のみ）
    Skip,
    /// 理由付きで隔離（本文終了時のみ）
    Quarantine(String),
    /// SMTP応答コードとテキストを指定して拒否・一時エラー
    ReplyCode { code: u16, text: String },
}

impl Action {
    /// 対応する応答コード
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Action::Continue => ReplyCode::Continue,
            Action::Accept => ReplyCode::Accept,
            Action::Reject => ReplyCode::Reject,
            Action::Discard => ReplyCode::Discard,
            Action::Tempfail => ReplyCode::Tempfail,
            Action::Skip => ReplyCode::Skip,
            Action::Quarantine(_) => ReplyCode::Quarantine,
            Action::ReplyCode { .. } => ReplyCode::ReplyCode,
        }
    }

    /// 以降のステージを続けてよい判定かどうか
    pub fn is_continue(&self) -> bool {
        matches!(self, Action::Continue)
    }

    /// SMTP応答コード付きの判定を生成（4xx/5xx以外はNone）
    pub fn with_reply(code: u16, text: impl Into<String>) -> Option<Self> {
        if !(400..600).contains(&code) {
            return None;
        }
        Some(Action::ReplyCode {
            code,
            text: text.into(),
        })
    }

    /// この判定を送るために必要なプロトコルフラグ（Skipのみ）
    pub fn required_protocol(&self) -> ProtocolFlags {
        match self {
            Action::Skip => ProtocolFlags::SKIP,
            _ => ProtocolFlags::empty(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Quarantine(reason) => write!(f, "quarantine ({})", reason),
            Action::ReplyCode { code, text } => write!(f, "reply {} {}", code, text),
            other => f.write_str(other.reply_code().as_str()),
        }
    }
}

/// メッセージ変更アクション
///
/// ChangeHeader/InsertHeaderの`index`は1始まりで、フィルタに届いた順での
/// 同名ヘッダの何番目かを指す。送信順や変更コマンドの順ではない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifyAction {
    AddHeader {
        name: String,
        value: String,
    },
    InsertHeader {
        index: u32,
        name: String,
        value: String,
    },
    /// valueが空ならそのヘッダを削除する
    ChangeHeader {
        index: u32,
        name: String,
        value: String,
    },
    AddRecipient {
        recipient: String,
        args: Option<String>,
    },
    DeleteRecipient {
        recipient: String,
    },
    ChangeFrom {
        from: String,
        args: Option<String>,
    },
    /// 置換後本文の1チャンク（複数並ぶと連結される）
    ReplaceBody {
        chunk: Vec<u8>,
    },
}

impl ModifyAction {
    /// 対応する応答コード
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ModifyAction::AddHeader { .. } => ReplyCode::AddHeader,
            ModifyAction::InsertHeader { .. } => ReplyCode::InsertHeader,
            ModifyAction::ChangeHeader { .. } => ReplyCode::ChangeHeader,
            ModifyAction::AddRecipient { args: None, .. } => ReplyCode::AddRcpt,
            ModifyAction::AddRecipient { args: Some(_), .. } => ReplyCode::AddRcptPar,
            ModifyAction::DeleteRecipient { .. } => ReplyCode::DelRcpt,
            ModifyAction::ChangeFrom { .. } => ReplyCode::ChangeFrom,
            ModifyAction::ReplaceBody { .. } => ReplyCode::ReplaceBody,
        }
    }

    /// このアクションを使うためにネゴシエーションで必要なフラグ
    pub fn required_flag(&self) -> ActionFlags {
        match self {
            ModifyAction::AddHeader { .. } | ModifyAction::InsertHeader { .. } => {
                ActionFlags::ADD_HEADERS
            }
            ModifyAction::ChangeHeader { .. } => ActionFlags::CHANGE_HEADERS,
            ModifyAction::AddRecipient { args: None, .. } => ActionFlags::ADD_RECIPIENTS,
            ModifyAction::AddRecipient { args: Some(_), .. } => {
                ActionFlags::ADD_RECIPIENTS_WITH_ARGS
            }
            ModifyAction::DeleteRecipient { .. } => ActionFlags::DELETE_RECIPIENTS,
            ModifyAction::ChangeFrom { .. } => ActionFlags::CHANGE_FROM,
            ModifyAction::ReplaceBody { .. } => ActionFlags::CHANGE_BODY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_constructor_validates_class() {
        assert!(Action::with_reply(250, "ok").is_none());
        assert!(Action::with_reply(600, "nope").is_none());
        assert_eq!(
            Action::with_reply(550, "5.7.1 go away"),
            Some(Action::ReplyCode {
                code: 550,
                text: "5.7.1 go away".to_string()
            })
        );
    }

    #[test]
    fn modify_actions_require_matching_flags() {
        let add = ModifyAction::AddHeader {
            name: "X-Bad".into(),
            value: "very".into(),
        };
        assert_eq!(add.required_flag(), ActionFlags::ADD_HEADERS);
        let change = ModifyAction::ChangeHeader {
            index: 1,
            name: "Subject".into(),
            value: "***SPAM***".into(),
        };
        assert_eq!(change.required_flag(), ActionFlags::CHANGE_HEADERS);
        let par = ModifyAction::AddRecipient {
            recipient: "<x@example.org>".into(),
            args: Some("NOTIFY=NEVER".into()),
        };
        assert_eq!(par.required_flag(), ActionFlags::ADD_RECIPIENTS_WITH_ARGS);
        assert_eq!(par.reply_code(), ReplyCode::AddRcptPar);
    }

    #[test]
    fn display_names_verdicts() {
        assert_eq!(Action::Continue.to_string(), "SMFIR_CONTINUE");
        assert_eq!(
            Action::Quarantine("spam".into()).to_string(),
            "quarantine (spam)"
        );
        assert_eq!(Action::Skip.required_protocol(), ProtocolFlags::SKIP);
    }
}
