//! The receiver loop.
//!
//! One reader task per connection decodes frames and routes each to
//! exactly one consumer: the encryption handshake, the server clock, the
//! caches, the proxy multiplexer, the file receiver, the notification
//! queue, a message subscription or the correlation engine. Nothing here
//! waits on consumer-side work.

use crate::cache::{
    event_template_from_frame, group_from_frame, user_from_frame, EVENT_TEMPLATE_MODIFIED,
    EVENT_TEMPLATE_REMOVED, USER_DB_OBJECT_DELETED,
};
use crate::error::SessionError;
use crate::notification::{self as notify, panic_reason, Notification, NotificationPayload, Record};
use crate::proxy::Routed;
use crate::reconnect;
use crate::session::SessionInner;
use crate::stream::SessionStream;
use nxsession_protocol::codes::*;
use futures::FutureExt;
use nxsession_protocol::{Decoder, EncryptionContext, FieldValue, Frame, ProtocolError, ResultCode};
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::task::JoinHandle;

/// Undecodable frames tolerated in a row before the connection is dropped.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// `VID_RECORDS_ORDER` value for batches sent newest first.
pub const RECORDS_ORDER_REVERSED: u32 = 1;

pub(crate) fn spawn_reader(
    inner: Arc<SessionInner>,
    half: ReadHalf<SessionStream>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(reader_task(inner, half, generation))
}

// Boxed so the reader -> reconnect -> reader cycle has a nameable type.
fn reader_task(
    inner: Arc<SessionInner>,
    half: ReadHalf<SessionStream>,
    generation: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tracing::debug!("reader {} started", generation);
        let cause = match AssertUnwindSafe(read_loop(&inner, half)).catch_unwind().await {
            Ok(cause) => cause,
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                tracing::error!("reader {} panicked: {}", generation, reason);
                SessionError::Protocol(ProtocolError::Dispatch(reason))
            }
        };
        tracing::debug!("reader {} stopped: {}", generation, cause);
        tokio::spawn(reconnect::connection_lost(inner, cause, generation));
    })
}

async fn read_loop(inner: &Arc<SessionInner>, mut half: ReadHalf<SessionStream>) -> SessionError {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; inner.config.read_buffer_size];
    let mut errors = 0u32;

    loop {
        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => {
                    errors = 0;
                    if let Err(cause) = dispatch_frame(inner, &mut decoder, frame).await {
                        return cause;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!("fatal protocol error: {}", e);
                    return SessionError::Protocol(e);
                }
                Err(e) => {
                    errors += 1;
                    tracing::warn!("dropping bad frame ({} in a row): {}", errors, e);
                    if errors > MAX_CONSECUTIVE_ERRORS {
                        tracing::error!("too many consecutive protocol errors");
                        return SessionError::Protocol(e);
                    }
                }
            }
        }

        match half.read(&mut buf).await {
            Ok(0) => {
                return SessionError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => return SessionError::Io(e),
        }
    }
}

/// Routes one frame. An error ends the connection.
async fn dispatch_frame(
    inner: &Arc<SessionInner>,
    decoder: &mut Decoder,
    frame: Frame,
) -> Result<(), SessionError> {
    tracing::debug!("<- {} id={}", message_code_name(frame.code), frame.id);
    match frame.code {
        CMD_REQUEST_SESSION_KEY => return setup_encryption(inner, decoder, &frame).await,
        CMD_KEEPALIVE => {
            if let Some(secs) = frame.get_u64(VID_TIMESTAMP) {
                inner.clock.update(secs);
            }
        }
        CMD_OBJECT | CMD_OBJECT_UPDATE => object_delta(inner, &frame),
        CMD_OBJECT_LIST_END => {
            inner.caches.complete_object_sync();
            inner.publish(Notification::new(notify::OBJECT_SYNC_COMPLETED));
        }
        CMD_USER_DATA | CMD_GROUP_DATA | CMD_USER_DB_UPDATE => user_delta(inner, &frame),
        CMD_USER_DB_EOF => {
            inner.caches.complete_user_sync();
            inner.publish(Notification::new(notify::USER_DB_SYNC_COMPLETED));
        }
        CMD_EVENT_DB_UPDATE => event_template_delta(inner, &frame),
        CMD_EVENTLOG_RECORDS => publish_records(inner, &frame, notify::NEW_EVENTLOG_RECORD),
        CMD_SYSLOG_RECORDS => publish_records(inner, &frame, notify::NEW_SYSLOG_RECORD),
        CMD_TRAP_LOG_RECORDS => publish_records(inner, &frame, notify::NEW_SNMP_TRAP),
        CMD_AUDIT_RECORD => publish_records(inner, &frame, notify::AUDIT_RECORD),
        CMD_ALARM_UPDATE if frame.contains(VID_NUM_RECORDS) => {
            publish_records(inner, &frame, notify::ALARM_CHANGED)
        }
        CMD_ALARM_UPDATE => {
            let subcode = frame.get_u64(VID_NOTIFICATION_CODE).unwrap_or(0);
            inner.publish(
                Notification::new(notify::ALARM_CHANGED)
                    .with_subcode(subcode)
                    .with_payload(NotificationPayload::Message(Arc::new(frame))),
            );
        }
        CMD_TCP_PROXY_DATA => {
            if let Routed::Overflow(channel) = inner.proxy.on_data(&frame) {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let close = Frame::new(CMD_CLOSE_TCP_PROXY).with_field(VID_CHANNEL_ID, channel);
                    let _ = inner.send(close).await;
                });
            }
        }
        CMD_CLOSE_TCP_PROXY => inner.proxy.on_close(&frame),
        CMD_FILE_DATA => inner.files.on_data(&frame),
        CMD_ABORT_FILE_TRANSFER => inner.files.on_abort(&frame),
        CMD_FILE_MONITORING => {
            if let Some(n) = inner.files.on_monitor(&frame) {
                inner.publish(n);
            }
        }
        CMD_JOB_CHANGE_NOTIFICATION => {
            let job = frame.get_u64(VID_JOB_ID).unwrap_or(0);
            inner.publish(
                Notification::new(notify::JOB_CHANGED)
                    .with_subcode(job)
                    .with_payload(NotificationPayload::Message(Arc::new(frame))),
            );
        }
        CMD_ADM_MESSAGE => {
            let text = frame.get_str(VID_MESSAGE).unwrap_or_default();
            inner.publish(
                Notification::new(notify::CONSOLE_OUTPUT).with_payload(NotificationPayload::Text(text)),
            );
        }
        CMD_NOTIFY => return generic_notification(inner, &frame, true),
        CMD_RS_NOTIFY => return generic_notification(inner, &frame, false),
        code => {
            if code >= CUSTOM_MESSAGE_BASE {
                inner.publish(
                    Notification::new(notify::CUSTOM_MESSAGE)
                        .with_subcode(u64::from(code))
                        .with_payload(NotificationPayload::Message(Arc::new(frame.clone()))),
                );
            }
            if let Err(frame) = inner.messages.dispatch(frame) {
                inner.waits.deliver(frame);
            }
        }
    }
    Ok(())
}

/// Answers `CMD_REQUEST_SESSION_KEY`. Encryption is switched on for both
/// directions only after the reply went out.
async fn setup_encryption(
    inner: &Arc<SessionInner>,
    decoder: &mut Decoder,
    request: &Frame,
) -> Result<(), SessionError> {
    match EncryptionContext::negotiate(request) {
        Ok((ctx, reply)) => {
            let ctx = Arc::new(ctx);
            inner.transport.send_and_encrypt(&reply, ctx.clone()).await?;
            decoder.set_encryption(Some(ctx));
            tracing::info!("session encryption enabled");
        }
        Err(e) => {
            tracing::warn!("cannot set up encryption: {}", e);
            let reply = EncryptionContext::failure_reply(request, ResultCode::NoCiphers);
            inner.transport.send(&reply).await?;
        }
    }
    Ok(())
}

fn object_delta(inner: &SessionInner, frame: &Frame) {
    let objects = &inner.caches.objects;
    if frame.get_bool(VID_IS_DELETED) {
        let Some(id) = frame.get_u32(VID_OBJECT_ID) else {
            return;
        };
        let payload = match objects.remove(id) {
            Some(entity) => NotificationPayload::Entity(entity),
            None => NotificationPayload::None,
        };
        inner.publish(
            Notification::new(notify::OBJECT_DELETED)
                .with_subcode(u64::from(id))
                .with_payload(payload),
        );
        return;
    }

    match inner.caches.registry.object_from_frame(frame) {
        Some(entity) => {
            let entity = objects.upsert(entity);
            // Objects streamed during a sync are not individual changes.
            if frame.code == CMD_OBJECT_UPDATE {
                inner.publish(
                    Notification::new(notify::OBJECT_CHANGED)
                        .with_subcode(u64::from(entity.id))
                        .with_payload(NotificationPayload::Entity(entity)),
                );
            }
        }
        None => tracing::warn!("object frame without id ignored"),
    }
}

fn user_delta(inner: &SessionInner, frame: &Frame) {
    let users = &inner.caches.users;
    if frame.code != CMD_USER_DB_UPDATE {
        // Streamed during a user database load; no notifications.
        if frame.get_bool(VID_IS_DELETED) {
            if let Some(id) = frame.get_u32(VID_USER_ID) {
                users.remove(id);
            }
            return;
        }
        let entity = if frame.code == CMD_GROUP_DATA {
            group_from_frame(frame)
        } else {
            user_from_frame(frame)
        };
        match entity {
            Some(entity) => {
                users.upsert(entity);
            }
            None => tracing::warn!("user database frame without id ignored"),
        }
        return;
    }

    let update = frame.get_u32(VID_UPDATE_TYPE).unwrap_or(0);
    let payload = if update == USER_DB_OBJECT_DELETED {
        frame
            .get_u32(VID_USER_ID)
            .and_then(|id| users.remove(id))
            .map(NotificationPayload::Entity)
    } else {
        user_from_frame(frame).map(|u| NotificationPayload::Entity(users.upsert(u)))
    };
    inner.publish(
        Notification::new(notify::USER_DB_CHANGED)
            .with_subcode(u64::from(update))
            .with_payload(payload.unwrap_or(NotificationPayload::None)),
    );
}

fn event_template_delta(inner: &SessionInner, frame: &Frame) {
    let templates = &inner.caches.event_templates;
    let code = frame.get_u32(VID_EVENT_CODE).unwrap_or(0);
    match frame.get_u32(VID_NOTIFICATION_CODE) {
        Some(EVENT_TEMPLATE_REMOVED) => {
            let payload = templates
                .remove(code)
                .map(NotificationPayload::Entity)
                .unwrap_or(NotificationPayload::None);
            inner.publish(
                Notification::new(notify::EVENT_TEMPLATE_DELETED)
                    .with_subcode(u64::from(code))
                    .with_payload(payload),
            );
        }
        Some(EVENT_TEMPLATE_MODIFIED) | None => {
            if let Some(template) = event_template_from_frame(frame) {
                let template = templates.upsert(template);
                inner.publish(
                    Notification::new(notify::EVENT_TEMPLATE_CHANGED)
                        .with_subcode(u64::from(code))
                        .with_payload(NotificationPayload::Entity(template)),
                );
            }
        }
        Some(other) => tracing::debug!("unknown event database update {}", other),
    }
}

/// Splits a streamed batch into records, oldest first.
///
/// The claimed record count is capped by the number of fields the frame
/// carries, and unpacking stops where record field ids would leave the
/// `u32` range.
pub fn unpack_records(frame: &Frame) -> Vec<Record> {
    let claimed = frame.get_u32(VID_NUM_RECORDS).unwrap_or(0);
    let count = claimed.min(u32::try_from(frame.field_count()).unwrap_or(u32::MAX));
    if count < claimed {
        tracing::warn!(
            "batch claims {} records but carries {} fields",
            claimed,
            frame.field_count()
        );
    }

    let mut records = Vec::with_capacity(count as usize);
    for index in 0..count {
        let Some(base) = index
            .checked_mul(RECORD_FIELD_STRIDE)
            .and_then(|offset| VID_RECORD_BASE.checked_add(offset))
        else {
            break;
        };
        let fields: Vec<(u32, FieldValue)> = (0..RECORD_FIELD_STRIDE)
            .filter_map(|offset| {
                let id = base.checked_add(offset)?;
                frame.get(id).map(|v| (offset, v.clone()))
            })
            .collect();
        records.push(Record { index, fields });
    }
    if frame.get_u32(VID_RECORDS_ORDER) == Some(RECORDS_ORDER_REVERSED) {
        records.reverse();
    }
    records
}

fn publish_records(inner: &SessionInner, frame: &Frame, code: u32) {
    for record in unpack_records(frame) {
        inner.publish(
            Notification::new(code)
                .with_subcode(u64::from(record.index))
                .with_payload(NotificationPayload::Record(Arc::new(record))),
        );
    }
}

/// Handles `CMD_NOTIFY` (`shifted`, code offset by `NOTIFY_BASE`) and
/// `CMD_RS_NOTIFY`. The peer killing the session ends the connection.
fn generic_notification(
    inner: &SessionInner,
    frame: &Frame,
    shifted: bool,
) -> Result<(), SessionError> {
    let raw = frame.get_u32(VID_NOTIFICATION_CODE).unwrap_or(0);
    if shifted && raw == notify::SESSION_KILLED {
        tracing::warn!("session terminated by server");
        inner.publish(Notification::new(notify::SESSION_KILLED));
        return Err(SessionError::SessionClosed);
    }
    let code = if shifted {
        match raw.checked_add(notify::NOTIFY_BASE) {
            Some(code) => code,
            None => {
                tracing::warn!("dropping notification with out-of-range code {}", raw);
                return Ok(());
            }
        }
    } else {
        raw
    };

    let payload = match frame.get(VID_NOTIFICATION_DATA) {
        Some(FieldValue::String(text)) => NotificationPayload::Text(text.clone()),
        _ => NotificationPayload::None,
    };
    inner.publish(
        Notification::new(code)
            .with_subcode(frame.get_u64(VID_NOTIFICATION_DATA).unwrap_or(0))
            .with_payload(payload),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(order: u32) -> Frame {
        let mut frame = Frame::new(CMD_EVENTLOG_RECORDS)
            .with_field(VID_NUM_RECORDS, 3u32)
            .with_field(VID_RECORDS_ORDER, order);
        for i in 0..3u32 {
            let base = VID_RECORD_BASE + i * RECORD_FIELD_STRIDE;
            frame.set(base, 100 + i);
            frame.set(base + 2, format!("event {}", i));
        }
        frame
    }

    #[test]
    fn test_unpack_records() {
        let records = unpack_records(&batch(0));
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].index, 1);
        assert_eq!(records[1].get(0), Some(&FieldValue::Int32(101)));
        assert_eq!(records[1].get(2), Some(&FieldValue::String("event 1".into())));
        assert!(records[1].get(1).is_none());
    }

    #[test]
    fn test_unpack_reversed_batch() {
        let indexes: Vec<u32> = unpack_records(&batch(RECORDS_ORDER_REVERSED))
            .iter()
            .map(|r| r.index)
            .collect();
        assert_eq!(indexes, vec![2, 1, 0]);
    }

    #[test]
    fn test_empty_batch() {
        assert!(unpack_records(&Frame::new(CMD_SYSLOG_RECORDS)).is_empty());
    }

    #[test]
    fn test_inflated_record_count_is_capped() {
        let frame = Frame::new(CMD_SYSLOG_RECORDS).with_field(VID_NUM_RECORDS, 5_000_000u32);
        assert!(unpack_records(&frame).len() <= frame.field_count());

        let mut frame = batch(0);
        frame.set(VID_NUM_RECORDS, u32::MAX);
        let records = unpack_records(&frame);
        assert!(records.len() <= frame.field_count());
        assert_eq!(records[2].get(2), Some(&FieldValue::String("event 2".into())));
    }
}
