//! Sink side of the SCP protocol (`scp -t`), kept free of I/O.

use super::RemoteFile;

/// Outcome of reading one acknowledgement from the sink.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Ack {
    /// More bytes are needed.
    Incomplete,
    /// Success; `consumed` bytes belong to the ack.
    Ok { consumed: usize },
    /// Warning (1) or fatal error (2) with the sink's message.
    Error {
        fatal: bool,
        message: String,
        consumed: usize,
    },
}

/// Reads an ack from the front of `buffer`.
pub(crate) fn parse_ack(buffer: &[u8]) -> Ack {
    match buffer.first() {
        None => Ack::Incomplete,
        Some(0) => Ack::Ok { consumed: 1 },
        Some(code @ (1 | 2)) => match buffer.iter().position(|b| *b == b'\n') {
            Some(end) => Ack::Error {
                fatal: *code == 2,
                message: String::from_utf8_lossy(&buffer[1..end]).trim().to_string(),
                consumed: end + 1,
            },
            None => Ack::Incomplete,
        },
        Some(other) => Ack::Error {
            fatal: true,
            message: format!("unexpected acknowledgement byte {other:#04x}"),
            consumed: buffer.len(),
        },
    }
}

/// Command starting the sink in the target directory.
pub(crate) fn sink_command(file: &RemoteFile) -> String {
    format!("scp -t {}", file.target_dir)
}

/// Prepares the target: stale file removed, directory present.
pub(crate) fn prepare_command(file: &RemoteFile) -> String {
    format!(
        "rm -f {} && mkdir -p {}",
        file.target_path(),
        file.target_dir
    )
}

/// `C<mode> <length> <name>\n`
pub(crate) fn file_header(file: &RemoteFile) -> String {
    format!(
        "C{} {} {}\n",
        file.permissions,
        file.content.len(),
        file.target_name
    )
}
