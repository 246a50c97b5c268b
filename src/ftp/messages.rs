use std::fmt;
use std::net::Ipv4Addr;

/// Numbered FTP replies. Each variant renders to its full reply line;
/// the table matches the classic server texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    OpenDataConn(String),
    OpenConn(String, String),
    Success200(&'static str),
    TypeSetOk(&'static str),
    StruOk,
    ModeOk,
    FileDate {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    },
    FileSize(u64),
    HelpStart,
    HelpEnd,
    ServerType(&'static str, &'static str),
    ServerReady(String),
    Goodbye,
    TransSuccess,
    PasvMode(Ipv4Addr, u16),
    LoginSuccess,
    Success250(&'static str),
    Success257(&'static str),
    AlreadyCurrent(String),
    PassRequired,
    RestartTransfer(u64),
    ReadyForDest,
    NoDataConn,
    TransferAborted,
    CmdUnknown(String),
    InternalError(String),
    ErrArgs,
    ModeUnknown,
    WrongByteSize,
    StruUnknown,
    LoginRequired,
    LoginMismatch,
    ErrNoList(String),
    ErrNoDir(String),
    ErrNoFile(String),
    ErrNoDirFile(String),
    ErrIsNotFile(String),
    ErrCreateDir(String),
    ErrDeleteFile(String),
    ErrDeleteDir(String),
    ErrOpenRead(String),
    ErrOpenWrite(String),
    ErrIo(String),
    ErrRename(String, String, String),
    ErrRnfrSource,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use StatusMessage::*;
        match self {
            OpenDataConn(mode) => {
                write!(f, "150 Opening {} mode data connection for file list", mode)
            }
            OpenConn(mode, path) => write!(f, "150 Opening {} connection for {}", mode, path),
            Success200(cmd) => write!(f, "200 {} command successful.", cmd),
            TypeSetOk(t) => write!(f, "200 Type set to {}.", t),
            StruOk => write!(f, "200 STRU F Ok."),
            ModeOk => write!(f, "200 MODE S Ok."),
            FileDate {
                year,
                month,
                day,
                hour,
                minute,
                second,
            } => write!(
                f,
                "213 {:04}{:02}{:02}{:02}{:02}{:02}",
                year, month, day, hour, minute, second
            ),
            FileSize(size) => write!(f, "213 {} Bytes", size),
            HelpStart => write!(f, "214-The following commands are recognized"),
            HelpEnd => write!(f, "214 Help done."),
            ServerType(os, label) => write!(f, "215 {} Type: {}", os, label),
            ServerReady(name) => {
                write!(f, "220 {} FTP server (Async/Thread V0.1) ready.", name)
            }
            Goodbye => write!(f, "221 Goodbye."),
            TransSuccess => write!(f, "226 Transfer successful."),
            PasvMode(ip, port) => {
                let [a, b, c, d] = ip.octets();
                write!(
                    f,
                    "227 Entering Passive Mode ({},{},{},{},{},{})",
                    a,
                    b,
                    c,
                    d,
                    port / 256,
                    port % 256
                )
            }
            LoginSuccess => write!(f, "230 Login Successful."),
            Success250(cmd) => write!(f, "250 {} command successful.", cmd),
            Success257(cmd) => write!(f, "257 {} command successful.", cmd),
            AlreadyCurrent(path) => write!(f, "257 \"{}\" is the current directory.", path),
            PassRequired => write!(f, "331 Password required"),
            RestartTransfer(pos) => write!(
                f,
                "350 Restarting at {}. Send STORE or RETRIEVE to initiate transfer.",
                pos
            ),
            ReadyForDest => write!(f, "350 File exists, ready for destination."),
            NoDataConn => write!(f, "425 Can't build data connection"),
            TransferAborted => write!(f, "426 Connection closed; transfer aborted."),
            CmdUnknown(cmd) => write!(f, "500 '{}': command not understood.", cmd),
            InternalError(info) => write!(f, "500 Internal error: {}", info),
            ErrArgs => write!(f, "500 Bad command arguments"),
            ModeUnknown => write!(f, "502 Unimplemented MODE type"),
            WrongByteSize => write!(f, "504 Byte size must be 8"),
            StruUnknown => write!(f, "504 Unimplemented STRU type"),
            LoginRequired => write!(f, "530 Please log in with USER and PASS"),
            LoginMismatch => write!(f, "530 The username and password do not match."),
            ErrNoList(err) => write!(f, "550 Could not list directory or file: {}", err),
            ErrNoDir(path) => write!(f, "550 \"{}\": No such directory.", path),
            ErrNoFile(path) => write!(f, "550 \"{}\": No such file.", path),
            ErrNoDirFile(path) => write!(f, "550 \"{}\": No such file or directory.", path),
            ErrIsNotFile(path) => write!(f, "550 \"{}\": Is not a file", path),
            ErrCreateDir(err) => write!(f, "550 Error creating directory: {}", err),
            ErrDeleteFile(err) => write!(f, "550 Error deleting file: {}", err),
            ErrDeleteDir(err) => write!(f, "550 Error removing directory: {}", err),
            ErrOpenRead(err) => write!(f, "553 Could not open file for reading: {}", err),
            ErrOpenWrite(err) => write!(f, "553 Could not open file for writing: {}", err),
            ErrIo(err) => write!(f, "553 I/O Error: {}", err),
            ErrRename(from, to, err) => {
                write!(f, "560 Could not rename \"{}\" to \"{}\": {}", from, to, err)
            }
            ErrRnfrSource => write!(f, "560 No source filename specified. Call RNFR first."),
        }
    }
}

impl StatusMessage {
    /// The numeric reply code.
    pub fn code(&self) -> u16 {
        self.to_string()[..3].parse().unwrap_or(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_the_classic_texts() {
        assert_eq!(StatusMessage::Goodbye.to_string(), "221 Goodbye.");
        assert_eq!(
            StatusMessage::TransSuccess.to_string(),
            "226 Transfer successful."
        );
        assert_eq!(
            StatusMessage::CmdUnknown("FOO".into()).to_string(),
            "500 'FOO': command not understood."
        );
        assert_eq!(
            StatusMessage::LoginRequired.to_string(),
            "530 Please log in with USER and PASS"
        );
        assert_eq!(
            StatusMessage::ErrNoFile("/x".into()).to_string(),
            "550 \"/x\": No such file."
        );
    }

    #[test]
    fn pasv_encodes_the_port_pair() {
        let msg = StatusMessage::PasvMode(Ipv4Addr::new(127, 0, 0, 1), 4040);
        assert_eq!(
            msg.to_string(),
            "227 Entering Passive Mode (127,0,0,1,15,200)"
        );
        assert_eq!(msg.code(), 227);
    }
}
