// Frontend message encoders. Messages that travel on an established
// connection are assembled into the connector's write buffer; the handful
// that go out on transient sockets (SSLRequest, CancelRequest) are returned
// as ready-to-send byte strings.

use bytes::{BufMut, BytesMut};

use crate::buffer::WriteBuffer;
use crate::constants::{CANCEL_REQUEST_CODE, PROTOCOL_VERSION_NUMBER, SSL_REQUEST_CODE};

/// StartupMessage. For historical reasons it carries no tag byte.
pub fn startup(buf: &mut WriteBuffer, parameters: &[(&str, &str)]) {
    buf.write_startup_packet(PROTOCOL_VERSION_NUMBER, parameters);
}

/// SSLRequest, sent before anything else when TLS is negotiated.
pub fn ssl_request() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(8);
    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);
    bytes
}

/// CancelRequest, sent on a dedicated socket with the key from
/// BackendKeyData.
pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// PasswordMessage: cleartext, MD5 digest or SHA-256 proof, depending on
/// the challenge. The payload is already in its on-wire form.
pub fn password_message(buf: &mut WriteBuffer, payload: &[u8]) {
    buf.begin_message(b'p');
    buf.write_bytes(payload);
    buf.end_message();
}

/// SASLInitialResponse with the chosen mechanism and the client-first
/// message.
pub fn sasl_initial_response(buf: &mut WriteBuffer, mechanism: &str, initial: &[u8]) {
    buf.begin_message(b'p');
    buf.write_cstring(mechanism);
    buf.write_i32(initial.len() as i32);
    buf.write_bytes(initial);
    buf.end_message();
}

/// SASLResponse continuing an exchange.
pub fn sasl_response(buf: &mut WriteBuffer, data: &[u8]) {
    buf.begin_message(b'p');
    buf.write_bytes(data);
    buf.end_message();
}

/// Query: the simple protocol.
pub fn simple_query(buf: &mut WriteBuffer, sql: &str) {
    buf.begin_message(b'Q');
    buf.write_cstring(sql);
    buf.end_message();
}

/// Sync: ends an extended-protocol batch; the server answers with
/// ReadyForQuery once it has consumed everything up to it.
pub fn sync(buf: &mut WriteBuffer) {
    buf.begin_message(b'S');
    buf.end_message();
}

/// Flush: ask the server to deliver pending responses without ending the
/// batch.
pub fn flush_request(buf: &mut WriteBuffer) {
    buf.begin_message(b'H');
    buf.end_message();
}

/// Terminate: the polite goodbye.
pub fn terminate(buf: &mut WriteBuffer) {
    buf.begin_message(b'X');
    buf.end_message();
}

/// Raw Terminate bytes for the best-effort path outside the buffer.
pub fn terminate_bytes() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'X');
    bytes.put_i32(4);
    bytes
}

/// CopyData carrying one chunk toward the server.
pub fn copy_data(buf: &mut WriteBuffer, data: &[u8]) {
    buf.begin_message(b'd');
    buf.write_bytes(data);
    buf.end_message();
}

/// CopyDone: the client finished a COPY FROM STDIN.
pub fn copy_done(buf: &mut WriteBuffer) {
    buf.begin_message(b'c');
    buf.end_message();
}

/// CopyFail with a reason; the server responds with an ErrorResponse.
pub fn copy_fail(buf: &mut WriteBuffer, message: &str) {
    buf.begin_message(b'f');
    buf.write_cstring(message);
    buf.end_message();
}

/// Standby status update, wrapped in CopyData on a replication connection.
pub fn standby_status_update(
    buf: &mut WriteBuffer,
    written: u64,
    flushed: u64,
    applied: u64,
    server_clock: i64,
    reply_requested: bool,
) {
    buf.begin_message(b'd');
    buf.write_byte(b'r');
    buf.write_i64(written as i64);
    buf.write_i64(flushed as i64);
    buf.write_i64(applied as i64);
    buf.write_i64(server_clock);
    buf.write_byte(reply_requested as u8);
    buf.end_message();
}
