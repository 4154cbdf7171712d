// =========================
// logging.rs
// milter_engine ログ出力マクロ定義
//
// 【このファイルで使う主なクレート】
// - chrono: 日時操作・整形（Local::now, format）
// - chrono-tz: タイムゾーン変換（設定で指定されたTz、既定はAsia::Tokyo）
// - lazy_static: ログ用タイムゾーンのグローバル保持
//
// 【役割】
// - printdaytimeln!: タイムスタンプ付きで標準出力にログを出すマクロ
// - eprintdaytimeln!: タイムスタンプ付きで標準エラー出力にログを出すマクロ
// - set_timezone: 設定ファイルのLog_timezoneを反映
// =========================

use chrono_tz::Tz;
use lazy_static::lazy_static;
use std::sync::RwLock;

lazy_static! {
    // ログのタイムスタンプに使うタイムゾーン（既定はJST）
    static ref LOG_TIMEZONE: RwLock<Tz> = RwLock::new(chrono_tz::Asia::Tokyo);
}

/// ログ用タイムゾーンを変更する
pub fn set_timezone(tz: Tz) {
    if let Ok(mut guard) = LOG_TIMEZONE.write() {
        *guard = tz;
    }
}

/// 現在のログ用タイムゾーン
pub fn timezone() -> Tz {
    LOG_TIMEZONE
        .read()
        .map(|guard| *guard)
        .unwrap_or(chrono_tz::Asia::Tokyo)
}

/// 現在時刻を"[%Y/%m/%d %H:%M:%S]"形式で返す（マクロから呼ばれる）
pub fn timestamp() -> String {
    let now = chrono::Local::now().with_timezone(&timezone()); // 設定タイムゾーンの現在時刻
    now.format("[%Y/%m/%d %H:%M:%S]").to_string()
}

/// タイムスタンプ付きで標準出力にログを出すマクロ
///
/// # 使い方
/// printdaytimeln!("メッセージ: {}", val);
#[macro_export]
macro_rules! printdaytimeln {
    ($($arg:tt)*) => {{
        println!("{} {}", $crate::logging::timestamp(), format!($($arg)*));
    }};
}

/// タイムスタンプ付きで標準エラー出力にログを出すマクロ
/// 送信失敗・コールバック失敗など、運用者が気付くべき事象に使う
#[macro_export]
macro_rules! eprintdaytimeln {
    ($($arg:tt)*) => {{
        eprintln!("{} {}", $crate::logging::timestamp(), format!($($arg)*));
    }};
}
