//! TCP listener: one thread per connection.

use std::{
    io::{self, BufRead, BufReader, ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use log::{debug, error, info};

use super::{
    error::SmtpError,
    response::SmtpResponse,
    session::{SessionSettings, SmtpSession, Step},
};
use crate::{relay::Relay, telegram::SendMessage};

pub struct SmtpServer<A> {
    relay: Arc<Relay<A>>,
    settings: Arc<SessionSettings>,
    read_timeout: Option<Duration>,
}

impl<A: SendMessage + 'static> SmtpServer<A> {
    pub fn new(relay: Relay<A>, settings: SessionSettings, read_timeout: Option<Duration>) -> Self {
        Self {
            relay: Arc::new(relay),
            settings: Arc::new(settings),
            read_timeout,
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<TcpListener, SmtpError> {
        Ok(TcpListener::bind(addr)?)
    }

    /// Accept connections until the listener fails. Blocks the calling thread.
    pub fn serve(&self, listener: TcpListener) -> Result<(), SmtpError> {
        info!(
            "[smtp2tg] SMTP server running on {} for domain {}",
            listener.local_addr()?,
            self.relay.domain()
        );

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("[smtp2tg] Error accepting connection: {e}");
                    continue;
                }
            };

            let relay = Arc::clone(&self.relay);
            let settings = Arc::clone(&self.settings);
            let read_timeout = self.read_timeout;

            thread::spawn(move || {
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_owned());
                info!("[smtp2tg] Connection accepted from {peer}");

                match handle_client(stream, &relay, &settings, read_timeout) {
                    Ok(()) => debug!("[smtp2tg] Client {peer} disconnected"),
                    Err(e) => error!("[smtp2tg] Client {peer} error: {e}"),
                }
            });
        }

        Ok(())
    }
}

fn handle_client<A: SendMessage>(
    stream: TcpStream,
    relay: &Relay<A>,
    settings: &SessionSettings,
    read_timeout: Option<Duration>,
) -> Result<(), SmtpError> {
    stream.set_read_timeout(read_timeout)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let mut session = SmtpSession::new(relay, settings);
    send_response(&mut writer, &session.greeting())?;

    let mut line = Vec::new();
    loop {
        line.clear();
        let limit = session.line_limit();

        let read = (&mut reader).take(limit as u64).read_until(b'\n', &mut line);
        let step = match read {
            Ok(0) => break,
            Ok(n) if n >= limit && !line.ends_with(b"\n") => {
                let step = session.handle_overlong_line();
                if let Step::Reply(response) = &step {
                    send_response(&mut writer, response)?;
                }
                match skip_line(&mut reader) {
                    Ok(()) => continue,
                    Err(e) if is_timeout(&e) => {
                        send_response(&mut writer, &idle_timeout())?;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(_) => session.handle_line(&line),
            Err(e) if is_timeout(&e) => {
                send_response(&mut writer, &idle_timeout())?;
                break;
            }
            Err(e) => return Err(e.into()),
        };

        match step {
            Step::Reply(response) => send_response(&mut writer, &response)?,
            Step::Close(response) => {
                send_response(&mut writer, &response)?;
                break;
            }
            Step::Continue => {}
        }
    }

    Ok(())
}

/// Consume input up to and including the next LF without keeping it.
fn skip_line(reader: &mut impl BufRead) -> io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn idle_timeout() -> SmtpResponse {
    SmtpResponse::new(421, "4.4.2 Idle timeout, closing connection")
}

fn send_response(writer: &mut TcpStream, response: &SmtpResponse) -> Result<(), SmtpError> {
    writer.write_all(response.format().as_bytes())?;
    writer.flush()?;
    Ok(())
}
