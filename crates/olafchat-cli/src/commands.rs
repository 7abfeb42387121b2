//! Interactive command loop.

use anyhow::Result;
use chrono::{Local, TimeZone};
use olafchat_core::client::{ClientEvent, ClientHandle, KnownUser, StoredMessage};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "\
Commands:
  messages                 show received messages
  users                    refresh and list known users
  public <text>            send a public broadcast
  chat <n[,m...]> <text>   send a private chat to users by index
  upload <path>            upload a file, prints its download URL
  download <url> [dest]    download a file
  help                     show this help
  quit                     exit";

/// Run the interactive loop until the user quits or the session closes.
pub async fn run(
    handle: ClientHandle,
    mut events: broadcast::Receiver<ClientEvent>,
    server_addr: String,
) -> Result<()> {
    let http = reqwest::Client::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", HELP);
    prompt();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match dispatch(&handle, &http, &server_addr, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {}", e),
                }
                prompt();
            }
            event = events.recv() => match event {
                Ok(ClientEvent::MessageReceived { sender, public }) => {
                    let kind = if public { "public" } else { "private" };
                    println!("\n[new {} message from {}]", kind, short(&sender));
                    prompt();
                }
                Ok(ClientEvent::Closed) => {
                    println!("\nsession closed by server");
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let _ = handle.close().await;
    Ok(())
}

fn prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn short(fingerprint: &str) -> String {
    if fingerprint.len() > 12 {
        format!("{}...", &fingerprint[..12])
    } else {
        fingerprint.to_string()
    }
}

/// Handle one command line. Returns false when the user asked to quit.
async fn dispatch(
    handle: &ClientHandle,
    http: &reqwest::Client,
    server_addr: &str,
    line: &str,
) -> Result<bool> {
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "help" => println!("{}", HELP),
        "quit" | "exit" => return Ok(false),
        "messages" => show_messages(&handle.messages().await),
        "users" => {
            handle.request_directory().await?;
            // Give the refresh a moment to arrive before printing.
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            show_users(&handle.users().await);
        }
        "public" => {
            if rest.is_empty() {
                println!("usage: public <text>");
            } else {
                handle.send_public_chat(rest.to_string()).await?;
                println!("sent");
            }
        }
        "chat" => send_chat(handle, rest).await?,
        "upload" => upload(http, server_addr, rest).await?,
        "download" => download(http, rest).await?,
        other => println!("unknown command {:?}, try 'help'", other),
    }
    Ok(true)
}

fn show_messages(messages: &[StoredMessage]) {
    if messages.is_empty() {
        println!("no messages");
        return;
    }
    for msg in messages {
        let when = Local
            .timestamp_opt(msg.received_at, 0)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "--:--:--".to_string());
        let to = if msg.is_public() {
            "Public".to_string()
        } else {
            msg.recipients
                .iter()
                .map(|r| short(r))
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("[{}] from={} to={} {}", when, short(&msg.sender), to, msg.text);
    }
}

fn show_users(users: &[KnownUser]) {
    if users.is_empty() {
        println!("nobody else is online");
        return;
    }
    for (index, user) in users.iter().enumerate() {
        println!("{}: {} @ {}", index, user.fingerprint, user.home_server);
    }
}

async fn send_chat(handle: &ClientHandle, rest: &str) -> Result<()> {
    let Some((indices, text)) = rest.split_once(' ') else {
        println!("usage: chat <n[,m...]> <text>");
        return Ok(());
    };
    let users = handle.users().await;
    let mut recipients = Vec::new();
    for part in indices.split(',') {
        match part.trim().parse::<usize>().ok().and_then(|i| users.get(i)) {
            Some(user) => recipients.push(user.fingerprint.clone()),
            None => {
                println!("invalid user index {:?}, run 'users' first", part);
                return Ok(());
            }
        }
    }
    handle.send_chat(text.trim().to_string(), recipients).await?;
    println!("sent");
    Ok(())
}

async fn upload(http: &reqwest::Client, server_addr: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        println!("usage: upload <path>");
        return Ok(());
    }
    let data = tokio::fs::read(path).await?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin");

    let response = http
        .post(format!("http://{}/api/upload", server_addr))
        .query(&[("filename", filename)])
        .body(data)
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
        println!("file too large (limit is 10 MiB)");
        return Ok(());
    }
    if !response.status().is_success() {
        println!("upload failed: {}", response.status());
        return Ok(());
    }

    let body: serde_json::Value = response.json().await?;
    match body.get("file_url").and_then(|v| v.as_str()) {
        Some(url) => println!("uploaded: {}", url),
        None => println!("upload succeeded but no URL came back"),
    }
    Ok(())
}

async fn download(http: &reqwest::Client, rest: &str) -> Result<()> {
    let (url, dest) = match rest.split_once(' ') {
        Some((url, dest)) => (url, dest.trim().to_string()),
        None if !rest.is_empty() => {
            let name = rest.rsplit('/').next().unwrap_or("download.bin");
            (rest, name.to_string())
        }
        None => {
            println!("usage: download <url> [dest]");
            return Ok(());
        }
    };

    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        println!("download failed: {}", response.status());
        return Ok(());
    }
    let bytes = response.bytes().await?;
    tokio::fs::write(&dest, &bytes).await?;
    println!("saved {} bytes to {}", bytes.len(), dest);
    Ok(())
}
