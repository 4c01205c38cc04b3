//! Command implementations for the nxsession binary.

use colored::Colorize;
use nxsession_client::filetransfer::prefix_hash;
use nxsession_client::notification as notify;
use nxsession_client::{
    ChannelState, EntityClass, Notification, NotificationPayload, ProgressListener, ProxyChannel,
    ProxyTarget, Session, SessionError, TwoFactorChallenge, TwoFactorHandler, UploadOptions,
};
use nxsession_protocol::codes::message_code_name;
use std::io::{BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Answers second-factor prompts on the terminal.
pub struct PromptTwoFactor;

impl TwoFactorHandler for PromptTwoFactor {
    fn select_method(&self, methods: &[String]) -> Option<usize> {
        if methods.len() == 1 {
            return Some(0);
        }
        eprintln!("{}", "Second factor required".yellow());
        for (i, method) in methods.iter().enumerate() {
            eprintln!("  {}) {}", i + 1, method);
        }
        let choice: usize = prompt("Method")?.parse().ok()?;
        choice.checked_sub(1).filter(|i| *i < methods.len())
    }

    fn challenge_response(&self, challenge: &TwoFactorChallenge) -> Option<String> {
        if let Some(text) = &challenge.challenge {
            eprintln!("{}: {}", "Challenge".cyan(), text);
        }
        if let Some(label) = &challenge.qr_label {
            eprintln!("{}: {}", "Enroll with".cyan(), label);
        }
        prompt(&challenge.method)
    }
}

fn prompt(label: &str) -> Option<String> {
    eprint!("{}: ", label);
    std::io::stderr().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    let line = line.trim().to_string();
    (!line.is_empty()).then_some(line)
}

pub async fn info(session: &Session) -> CmdResult {
    let server = session.server_info();
    let caps = session.capabilities();
    println!("{}", "Server".green());
    println!("  version:   {}", server.server_version);
    println!("  id:        {:016x}", server.server_id);
    println!("  protocol:  {}", server.protocol_version);
    if !server.timezone.is_empty() {
        println!("  timezone:  {}", server.timezone);
    }
    if let Some(time) = session.server_time() {
        println!("  time:      {}", time.to_rfc3339());
    }
    println!(
        "  features:  two-phase proxy={} peer proxy ids={} resume={} compression={}",
        caps.two_phase_proxy(),
        caps.peer_assigned_proxy_ids(),
        caps.file_resume(),
        caps.compression()
    );

    println!("{}", "Session".green());
    if let Some(login) = session.login_info() {
        println!("  user id:   {}", login.user_id);
        println!("  session:   {}", login.session_id);
        println!("  rights:    {:#x}", login.system_rights);
    }
    println!("  encrypted: {}", session.is_encrypted().await);
    Ok(())
}

pub async fn watch(session: &Session, topics: &[String]) -> CmdResult {
    session.add_listener(Arc::new(|n: &Notification| {
        println!("{}", describe(n));
    }));
    for topic in topics {
        session.subscribe(topic).await?;
        eprintln!("{} {}", "Subscribed".green(), topic.cyan());
    }
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n{}", "Stopping...".yellow());
        }
        _ = wait_disconnected(session) => {
            eprintln!("{}", "Connection closed".red());
        }
    }

    for topic in topics {
        if let Err(e) = session.unsubscribe(topic).await {
            tracing::debug!("unsubscribe {} failed: {}", topic, e);
        }
    }
    if session.dropped_notifications() > 0 {
        eprintln!(
            "{} {} notification(s) dropped",
            "Warning:".yellow(),
            session.dropped_notifications()
        );
    }
    Ok(())
}

async fn wait_disconnected(session: &Session) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        if session.state() == nxsession_client::ConnectionState::Disconnected {
            return;
        }
    }
}

fn describe(n: &Notification) -> String {
    let name = notification_name(n.code).cyan();
    match &n.payload {
        NotificationPayload::None => format!("{} subcode={}", name, n.subcode),
        NotificationPayload::Entity(entity) => {
            format!("{} {} [{}]", name, entity.name, entity.id)
        }
        NotificationPayload::Record(record) => {
            format!("{} record #{} ({} fields)", name, record.index, record.fields.len())
        }
        NotificationPayload::Message(frame) => {
            format!("{} {} id={}", name, message_code_name(frame.code), frame.id)
        }
        NotificationPayload::Text(text) => format!("{} {}", name, text.trim_end()),
        NotificationPayload::Error(cause) => format!("{} {}", name, cause.to_string().red()),
    }
}

fn notification_name(code: u32) -> String {
    let name = match code {
        notify::CONNECTION_BROKEN => "connection-broken",
        notify::NEW_EVENTLOG_RECORD => "event",
        notify::USER_DB_CHANGED => "user-changed",
        notify::OBJECT_CHANGED => "object-changed",
        notify::OBJECT_DELETED => "object-deleted",
        notify::NEW_SYSLOG_RECORD => "syslog",
        notify::NEW_SNMP_TRAP => "snmp-trap",
        notify::SESSION_KILLED => "session-killed",
        notify::ALARM_CHANGED => "alarm",
        notify::AUDIT_RECORD => "audit",
        notify::EVENT_TEMPLATE_CHANGED => "event-template-changed",
        notify::EVENT_TEMPLATE_DELETED => "event-template-deleted",
        notify::CUSTOM_MESSAGE => "message",
        notify::FILE_MONITOR => "file-monitor",
        notify::OBJECT_SYNC_COMPLETED => "object-sync-completed",
        notify::RECONNECTING => "reconnecting",
        notify::RECONNECT_COMPLETED => "reconnected",
        notify::JOB_CHANGED => "job-changed",
        notify::CONSOLE_OUTPUT => "console",
        notify::USER_DB_SYNC_COMPLETED => "user-sync-completed",
        code if code >= notify::NOTIFY_BASE => {
            return format!("notify-{}", code - notify::NOTIFY_BASE)
        }
        code => return format!("notification-{}", code),
    };
    name.to_string()
}

pub async fn objects(session: &Session, name: Option<&str>) -> CmdResult {
    session.sync_objects().await?;
    let mut list = session
        .objects()
        .find(|o| name.map_or(true, |n| o.name.contains(n)));
    list.sort_by_key(|o| o.id);

    if list.is_empty() {
        println!("{}", "No objects".dimmed());
        return Ok(());
    }
    for object in list {
        let detail = match &object.class {
            EntityClass::Node { primary_ip } => {
                format!("node {}", primary_ip.as_deref().unwrap_or("-"))
            }
            EntityClass::Interface { ip_address, .. } => {
                format!("interface {}", ip_address.as_deref().unwrap_or("-"))
            }
            EntityClass::Subnet { ip_address } => {
                format!("subnet {}", ip_address.as_deref().unwrap_or("-"))
            }
            EntityClass::Container { children } => format!("container ({} children)", children.len()),
            EntityClass::Zone => "zone".to_string(),
            EntityClass::Network => "network".to_string(),
            EntityClass::User { is_group } => {
                (if *is_group { "group" } else { "user" }).to_string()
            }
            EntityClass::EventTemplate { code } => format!("event template {}", code),
            EntityClass::Custom { tag, .. } | EntityClass::Generic { tag } => {
                format!("class {}", tag)
            }
        };
        println!("{:>8}  {:<32}  {}", object.id, object.name.cyan(), detail.dimmed());
    }
    Ok(())
}

/// Prints upload progress on one terminal line.
#[derive(Default)]
struct ProgressLine {
    total: AtomicU64,
}

impl ProgressListener for ProgressLine {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn mark_progress(&self, done: u64) {
        let total = self.total.load(Ordering::Relaxed).max(1);
        eprint!("\r  {:>3}%  {} / {} bytes", done * 100 / total, done, total);
    }
}

pub async fn upload(
    session: &Session,
    local: &Path,
    remote: Option<String>,
    resume: bool,
    no_compress: bool,
) -> CmdResult {
    let remote = match remote {
        Some(name) => name,
        None => local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or("cannot derive remote name from the local path")?,
    };
    let mut options = UploadOptions::default().with_progress(Arc::new(ProgressLine::default()));
    options.resume = resume;
    if no_compress {
        options.compress = Some(false);
    }

    let summary = session.upload_file(local, &remote, options).await?;
    eprintln!();
    if summary.offset > 0 {
        println!(
            "{} {} ({} bytes, resumed at {})",
            "Uploaded".green(),
            remote.cyan(),
            summary.sent,
            summary.offset
        );
    } else {
        println!("{} {} ({} bytes)", "Uploaded".green(), remote.cyan(), summary.sent);
    }
    Ok(())
}

pub async fn download(session: &Session, remote: &str, output: Option<PathBuf>) -> CmdResult {
    let file = session.download_file(remote).await?;
    let size = file.size();
    let dest = match output {
        Some(path) => path,
        None => PathBuf::from(
            Path::new(remote)
                .file_name()
                .ok_or("cannot derive a local name from the remote name")?,
        ),
    };
    let dest = file.persist(dest)?;
    println!("{} {} ({} bytes)", "Saved".green(), dest.display(), size);
    Ok(())
}

pub async fn tail(session: &Session, remote: &str) -> CmdResult {
    let (file, mut follower) = session.follow_file(remote).await?;
    let head = tokio::fs::read(file.path()).await?;
    print!("{}", String::from_utf8_lossy(&head));
    eprintln!("{}", "Following, press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            text = follower.next() => match text {
                Some(text) => {
                    print!("{}", text);
                    std::io::stdout().flush()?;
                }
                None => {
                    eprintln!("{}", "Server stopped the file monitor".yellow());
                    return Ok(());
                }
            }
        }
    }
    follower.cancel().await?;
    Ok(())
}

fn parse_target(target: &str, node: Option<u32>) -> Result<ProxyTarget, Box<dyn std::error::Error>> {
    if let Some(node_id) = node {
        let port = target.rsplit(':').next().unwrap_or(target).parse()?;
        return Ok(ProxyTarget::Node { node_id, port });
    }
    let addr: SocketAddr = target.parse()?;
    let address: IpAddr = addr.ip();
    Ok(ProxyTarget::Address {
        address,
        port: addr.port(),
    })
}

pub async fn forward(session: &Session, listen: SocketAddr, target: &str, node: Option<u32>) -> CmdResult {
    let target = parse_target(target, node)?;
    let listener = TcpListener::bind(listen).await?;
    eprintln!(
        "{} {} -> {}",
        "Forwarding".green(),
        listen.to_string().cyan(),
        target.to_string().cyan()
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let session = session.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    match session.open_proxy(target).await {
                        Ok(channel) => {
                            tracing::info!("channel {} opened for {}", channel.id(), peer);
                            if let Err(e) = bridge(stream, channel).await {
                                tracing::warn!("forwarding for {} ended: {}", peer, e);
                            }
                        }
                        Err(e) => eprintln!("{}: {}", "Proxy setup failed".red(), e),
                    }
                });
            }
        }
    }
    Ok(())
}

/// Copies bytes both ways until either side closes.
async fn bridge(mut stream: TcpStream, mut channel: ProxyChannel) -> Result<(), SessionError> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            n = stream.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                channel.write_all(&buf[..n]).await?;
            }
            chunk = channel.read_chunk() => match chunk? {
                Some(data) => stream.write_all(&data).await?,
                None => break,
            }
        }
    }
    if channel.state() == ChannelState::Open {
        channel.close().await?;
    }
    Ok(())
}

pub async fn fingerprint(path: &Path) -> CmdResult {
    let len = tokio::fs::metadata(path).await?.len();
    let hash = prefix_hash(path, len)
        .await?
        .ok_or("file changed while hashing")?;
    println!("{}  {} bytes  {}", hex::encode(hash), len, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_target() {
        let target = parse_target("10.0.0.5:22", None).unwrap();
        assert_eq!(
            target,
            ProxyTarget::Address {
                address: "10.0.0.5".parse().unwrap(),
                port: 22
            }
        );
    }

    #[test]
    fn test_parse_node_target() {
        assert_eq!(
            parse_target("3389", Some(17)).unwrap(),
            ProxyTarget::Node {
                node_id: 17,
                port: 3389
            }
        );
        assert!(parse_target("not-an-address", None).is_err());
    }

    #[test]
    fn test_notification_names() {
        assert_eq!(notification_name(notify::ALARM_CHANGED), "alarm");
        assert_eq!(notification_name(notify::NOTIFY_BASE + 4), "notify-4");
        assert_eq!(notification_name(999), "notification-999");
    }
}
