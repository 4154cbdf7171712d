// =========================
// main.rs
// milter_engine メインプログラム（Milterフィルタサーバー）
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期TCPサーバ・シグナル・ブロードキャスト（net::TcpListener, sync::broadcast, signal::unix）
// - std: スレッド安全な参照カウント・ロック（Arc, RwLock）
// - milter_engine: Server（接続受付・ディスパッチ）、設定、ログ
// - decode_filter: メール再構成・MIMEパース出力を行うサンプルフィルタ
//
// 【役割】
// - 設定読込・ログタイムゾーン設定・待受・シグナル処理
// - SIGHUPで設定再読込とリスナー再バインド、SIGTERMで終了
// =========================

mod decode_filter; // サンプルフィルタ

use std::sync::{Arc, RwLock}; // スレッド安全な参照カウント・ロック

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind}; // Unix系: シグナル受信
#[cfg(windows)]
use tokio::signal::windows::{ctrl_break, ctrl_c}; // Windows: Ctrl+C/Break受信
use tokio::{net::TcpListener, sync::broadcast}; // 非同期TCPサーバ・ブロードキャスト

use decode_filter::DecodeFilter;
use milter_engine::config::{load_config, DEFAULT_CONFIG_FILE};
use milter_engine::{eprintdaytimeln, logging, printdaytimeln, Config, Server};

// 設定ファイルを読む（失敗時は既定値）
fn read_config() -> Config {
    match load_config(DEFAULT_CONFIG_FILE) {
        Ok(config) => config,
        Err(e) => {
            eprintdaytimeln!("設定読込失敗: {} (既定値で起動)", e);
            Config::default()
        }
    }
}

/// 非同期メイン関数（Tokioランタイム）
#[tokio::main]
async fn main() {
    // 設定をスレッド安全に共有（Arc+RwLock）
    let config = Arc::new(RwLock::new(read_config()));
    // 再起動通知用ブロードキャストチャネル
    let (reload_tx, _) = broadcast::channel::<()>(100);

    #[cfg(unix)]
    {
        let config = Arc::clone(&config);
        let reload_tx = reload_tx.clone();
        // SIGHUP受信: 設定ファイル再読込
        tokio::spawn(async move {
            let mut hup = signal(SignalKind::hangup()).expect("SIGHUP登録失敗");
            while hup.recv().await.is_some() {
                printdaytimeln!("SIGHUP受信: 設定ファイル再読込");
                let new_config = read_config();
                if let Ok(mut guard) = config.write() {
                    *guard = new_config;
                }
                let _ = reload_tx.send(()); // リスナーへ再起動通知
            }
        });
        // SIGTERM受信: サーバー安全終了
        tokio::spawn(async move {
            let mut term = signal(SignalKind::terminate()).expect("SIGTERM登録失敗");
            if term.recv().await.is_some() {
                printdaytimeln!("SIGTERM受信: サーバー安全終了");
                std::process::exit(0);
            }
        });
    }

    #[cfg(windows)]
    {
        let config = Arc::clone(&config);
        let reload_tx = reload_tx.clone();
        // Ctrl+C受信: 設定ファイル再読込（SIGHUP相当）
        tokio::spawn(async move {
            let mut ctrl_c_signal = ctrl_c().expect("Ctrl+C登録失敗");
            while ctrl_c_signal.recv().await.is_some() {
                printdaytimeln!("Ctrl+C受信: 設定ファイル再読込");
                let new_config = read_config();
                if let Ok(mut guard) = config.write() {
                    *guard = new_config;
                }
                let _ = reload_tx.send(());
            }
        });
        // Ctrl+Break受信: サーバー安全終了（SIGTERM相当）
        tokio::spawn(async move {
            let mut ctrl_break_signal = ctrl_break().expect("Ctrl+Break登録失敗");
            if ctrl_break_signal.recv().await.is_some() {
                printdaytimeln!("Ctrl+Break受信: サーバー安全終了");
                std::process::exit(0);
            }
        });
    }

    loop {
        // サーバー再起動ループ
        let current = config
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        logging::set_timezone(current.log_timezone);
        printdaytimeln!(
            "設定読込: {} actions={} protocol={}",
            current.address,
            current.actions,
            current.protocol
        );
        let listener = match TcpListener::bind(&current.address).await {
            Ok(listener) => {
                printdaytimeln!("待受開始: {}", current.address);
                listener
            }
            Err(e) => {
                eprintdaytimeln!(
                    "ポートバインド失敗: {} (他プロセスが {} 使用中?)",
                    e,
                    current.address
                );
                std::process::exit(1);
            }
        };

        let server = Arc::new(Server::new(DecodeFilter::default, current));
        let mut reload_rx = reload_tx.subscribe();
        let closer = Arc::clone(&server);
        tokio::spawn(async move {
            if reload_rx.recv().await.is_ok() {
                closer.close(); // 受付ループと既存接続を終了
            }
        });
        if let Err(e) = server.serve(listener).await {
            eprintdaytimeln!("待受エラー: {}", e);
        }
        printdaytimeln!("再起動のためリスナー再バインド");
    }
}
