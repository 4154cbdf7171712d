// =========================
// flags.rs
// ケイパビリティのビットセット定義（アクションフラグ・プロトコルフラグ）
//
// 【このファイルで使う主なクレート】
// - std: ビット演算トレイト（BitOr, BitAnd）、フォーマット
// - crate::error: 設定ファイル由来のフラグ名解釈エラー
//
// 【役割】
// - ActionFlags: フィルタが使ってよい変更アクション（SMFIF_*）
// - ProtocolFlags: 省略・無応答にするプロトコルステップ（SMFIP_*）
// - フラグ名 ⇔ ビットの対応表（ログ出力・設定ファイル読込で共用）
// =========================

use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::error::{Error, Result};

// 名前付きビット定数・名前表・集合演算をまとめて生成する
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$cmeta:meta])* $flag:ident = $bit:expr, $label:literal;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$cmeta])* pub const $flag: $name = $name($bit);)*

            /// 名前とビットの対応表（ログ出力・設定読込用）
            pub const NAMED: &'static [(&'static str, $name)] = &[$(($label, $name::$flag),)*];

            /// 空集合
            pub const fn empty() -> Self {
                $name(0)
            }

            /// 定義済みビットの全集合
            pub const fn all() -> Self {
                $name(0 $(| $bit)*)
            }

            /// ワイヤ上の値から生成（未定義ビットは保持しない）
            pub const fn from_bits_truncate(bits: u32) -> Self {
                $name(bits & Self::all().0)
            }

            /// ワイヤ上の値
            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// otherの全ビットを含むならtrue
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// selfがotherの部分集合ならtrue
            pub const fn is_subset_of(self, other: Self) -> bool {
                other.contains(self)
            }

            pub const fn intersection(self, other: Self) -> Self {
                $name(self.0 & other.0)
            }

            pub const fn union(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }

            /// 立っているビットの名前一覧
            pub fn names(self) -> Vec<&'static str> {
                Self::NAMED
                    .iter()
                    .filter(|(_, flag)| self.contains(*flag))
                    .map(|(label, _)| *label)
                    .collect()
            }

            /// 名前1つからフラグへ変換（大文字小文字は区別しない）
            pub fn from_name(name: &str) -> Option<Self> {
                Self::NAMED
                    .iter()
                    .find(|(label, _)| label.eq_ignore_ascii_case(name.trim()))
                    .map(|(_, flag)| *flag)
            }

            /// カンマ区切りの名前列からフラグ集合を生成
            /// 例: "add_headers, change_headers"
            pub fn parse_list(text: &str) -> Result<Self> {
                let mut set = Self::empty();
                for part in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    match Self::from_name(part) {
                        Some(flag) => set = set.union(flag),
                        None => {
                            return Err(Error::Config(format!(
                                "unknown {} flag: {}",
                                stringify!($name),
                                part
                            )))
                        }
                    }
                }
                Ok(set)
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                self.intersection(rhs)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{:08X} {:?})", stringify!($name), self.0, self.names())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_empty() {
                    return f.write_str("(none)");
                }
                f.write_str(&self.names().join("|"))
            }
        }
    };
}

flag_set! {
    /// フィルタが発行してよい変更アクション（SMFIF_*、プロトコルv6のビット配置）
    ActionFlags {
        ADD_HEADERS = 0x0000_0001, "add_headers";
        CHANGE_BODY = 0x0000_0002, "change_body";
        ADD_RECIPIENTS = 0x0000_0004, "add_recipients";
        DELETE_RECIPIENTS = 0x0000_0008, "delete_recipients";
        CHANGE_HEADERS = 0x0000_0010, "change_headers";
        /// 交渉上の表明のみ。Quarantine判定は本文終了でならこのフラグなしでも返せる
        QUARANTINE = 0x0000_0020, "quarantine";
        CHANGE_FROM = 0x0000_0040, "change_from";
        ADD_RECIPIENTS_WITH_ARGS = 0x0000_0080, "add_recipients_with_args";
        SET_MACROS = 0x0000_0100, "set_macros";
    }
}

flag_set! {
    /// 省略・無応答にするプロトコルステップ（SMFIP_*、プロトコルv6のビット配置）
    ProtocolFlags {
        NO_CONNECT = 0x0000_0001, "no_connect";
        NO_HELO = 0x0000_0002, "no_helo";
        NO_MAIL = 0x0000_0004, "no_mail";
        NO_RCPT = 0x0000_0008, "no_rcpt";
        NO_BODY = 0x0000_0010, "no_body";
        NO_HEADERS = 0x0000_0020, "no_headers";
        NO_EOH = 0x0000_0040, "no_eoh";
        NO_REPLY_HEADER = 0x0000_0080, "no_reply_header";
        NO_UNKNOWN = 0x0000_0100, "no_unknown";
        NO_DATA = 0x0000_0200, "no_data";
        /// 本文チャンクへのSkip応答を許可
        SKIP = 0x0000_0400, "skip";
        /// 拒否された宛先もフィルタへ送る
        REJECTED_RCPT = 0x0000_0800, "rejected_rcpt";
        NO_REPLY_CONNECT = 0x0000_1000, "no_reply_connect";
        NO_REPLY_HELO = 0x0000_2000, "no_reply_helo";
        NO_REPLY_MAIL = 0x0000_4000, "no_reply_mail";
        NO_REPLY_RCPT = 0x0000_8000, "no_reply_rcpt";
        NO_REPLY_DATA = 0x0001_0000, "no_reply_data";
        NO_REPLY_UNKNOWN = 0x0002_0000, "no_reply_unknown";
        NO_REPLY_EOH = 0x0004_0000, "no_reply_eoh";
        NO_REPLY_BODY = 0x0008_0000, "no_reply_body";
        HEADER_LEADING_SPACE = 0x0010_0000, "header_leading_space";
    }
}
