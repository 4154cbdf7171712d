// =========================
// lib.rs
// milter_engine ライブラリ本体
//
// 【このファイルで使う主なクレート】
// - 各モジュールの公開と主要型の再エクスポートのみ
//
// 【役割】
// - ワイヤ形式（frame, message, command）
// - ケイパビリティ交渉（flags, negotiate）
// - MTA側セッション（session）とフィルタ側サーバー（server, filter, modifier）
// - 両側で共有するステージ順序（stage）
// - 設定・ログ・エラー（config, logging, error）
// =========================

pub mod action; // 判定・変更アクション
pub mod command; // コマンド・応答コード定義
pub mod config; // 設定ファイル管理
pub mod error; // エラー型
pub mod filter; // フィルタのコールバック契約
pub mod flags; // アクション・プロトコルフラグ
pub mod frame; // フレーム符号化・非同期フレームI/O
pub mod logging; // タイムスタンプ付きログ出力
pub mod macros; // ステージ別マクロ表
pub mod message; // 型付きイベント・応答
pub mod modifier; // コールバック中の変更ハンドル
pub mod negotiate; // オプション交渉
pub mod server; // フィルタ側サーバー
pub mod session; // MTA側セッション
pub mod stage; // ステージ順序

pub use action::{Action, ModifyAction};
pub use command::{Command, MacroStage, ReplyCode};
pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use filter::{Filter, FilterError, FilterFactory, FilterResult};
pub use flags::{ActionFlags, ProtocolFlags};
pub use message::{AddressFamily, ConnectInfo};
pub use modifier::Modifier;
pub use negotiate::Capabilities;
pub use server::Server;
pub use session::ClientSession;
