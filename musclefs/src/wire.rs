//! The 9P2000 message codec: little-endian fields, `u16`-length-prefixed
//! strings, 13-byte qids, and frames prefixed with their total size.
//! Messages are read from and written to tokio async streams; parsing
//! happens on complete frames.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message either side may send; msize negotiation caps at this.
pub const MAX_MSIZE: u32 = 64 * 1024;

/// Bytes of framing around an Rread/Twrite payload, per the protocol.
pub const IOHDRSZ: u32 = 24;

pub const NOTAG: u16 = 0xffff;
pub const NOFID: u32 = 0xffff_ffff;

pub const QTDIR: u8 = 0x80;
pub const QTEXCL: u8 = 0x20;
pub const QTFILE: u8 = 0x00;

pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;
pub const ORCLOSE: u8 = 0x40;

/// 9P caps the number of walk elements per Twalk.
pub const MAXWELEM: usize = 16;

const QID_DONT_TOUCH: Qid = Qid {
    typ: 0xff,
    version: u32::MAX,
    path: u64::MAX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qid {
    pub typ: u8,
    pub version: u32,
    pub path: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// A stat whose every field means "don't touch", the Twstat baseline.
    pub fn nil() -> Self {
        Stat {
            typ: u16::MAX,
            dev: u32::MAX,
            qid: QID_DONT_TOUCH,
            mode: u32::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    pub fn change_length(&self) -> bool {
        self.length != u64::MAX
    }

    pub fn change_mode(&self) -> bool {
        self.mode != u32::MAX
    }

    pub fn change_mtime(&self) -> bool {
        self.mtime != u32::MAX
    }

    pub fn change_atime(&self) -> bool {
        self.atime != u32::MAX
    }

    pub fn change_name(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn change_gid(&self) -> bool {
        !self.gid.is_empty()
    }

    pub fn change_muid(&self) -> bool {
        !self.muid.is_empty()
    }

    /// Type, dev and qid may never be changed by a client.
    pub fn change_illegal_fields(&self) -> bool {
        self.typ != u16::MAX || self.dev != u32::MAX || self.qid != QID_DONT_TOUCH
    }

    fn encoded_len(&self) -> usize {
        // size[2] type[2] dev[4] qid[13] mode[4] atime[4] mtime[4] length[8]
        // + four strings, each with a u16 length prefix
        2 + 2
            + 4
            + 13
            + 4
            + 4
            + 4
            + 8
            + 2
            + self.name.len()
            + 2
            + self.uid.len()
            + 2
            + self.gid.len()
            + 2
            + self.muid.len()
    }

    /// Serializes the stat, leading size field included.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le((self.encoded_len() - 2) as u16);
        buf.put_u16_le(self.typ);
        buf.put_u32_le(self.dev);
        put_qid(buf, &self.qid);
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.atime);
        buf.put_u32_le(self.mtime);
        buf.put_u64_le(self.length);
        put_string(buf, &self.name);
        put_string(buf, &self.uid);
        put_string(buf, &self.gid);
        put_string(buf, &self.muid);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> io::Result<Self> {
        let _size = get_u16(buf)?;
        Ok(Stat {
            typ: get_u16(buf)?,
            dev: get_u32(buf)?,
            qid: get_qid(buf)?,
            mode: get_u32(buf)?,
            atime: get_u32(buf)?,
            mtime: get_u32(buf)?,
            length: get_u64(buf)?,
            name: get_string(buf)?,
            uid: get_string(buf)?,
            gid: get_string(buf)?,
            muid: get_string(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tmessage {
    Version { msize: u32, version: String },
    Auth { afid: u32, uname: String, aname: String },
    Attach { fid: u32, afid: u32, uname: String, aname: String },
    Flush { oldtag: u16 },
    Walk { fid: u32, newfid: u32, names: Vec<String> },
    Open { fid: u32, mode: u8 },
    Create { fid: u32, name: String, perm: u32, mode: u8 },
    Read { fid: u32, offset: u64, count: u32 },
    Write { fid: u32, offset: u64, data: Bytes },
    Clunk { fid: u32 },
    Remove { fid: u32 },
    Stat { fid: u32 },
    Wstat { fid: u32, stat: Stat },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rmessage {
    Version { msize: u32, version: String },
    Auth { aqid: Qid },
    Error { ename: String },
    Attach { qid: Qid },
    Flush,
    Walk { qids: Vec<Qid> },
    Open { qid: Qid, iounit: u32 },
    Create { qid: Qid, iounit: u32 },
    Read { data: Bytes },
    Write { count: u32 },
    Clunk,
    Remove,
    Stat { stat: Stat },
    Wstat,
}

fn bad(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn get_u8(buf: &mut Bytes) -> io::Result<u8> {
    if buf.remaining() < 1 {
        return Err(bad("truncated message"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> io::Result<u16> {
    if buf.remaining() < 2 {
        return Err(bad("truncated message"));
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut Bytes) -> io::Result<u32> {
    if buf.remaining() < 4 {
        return Err(bad("truncated message"));
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> io::Result<u64> {
    if buf.remaining() < 8 {
        return Err(bad("truncated message"));
    }
    Ok(buf.get_u64_le())
}

fn get_string(buf: &mut Bytes) -> io::Result<String> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(bad("truncated string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| bad("string is not utf-8"))
}

fn get_bytes(buf: &mut Bytes, len: usize) -> io::Result<Bytes> {
    if buf.remaining() < len {
        return Err(bad("truncated payload"));
    }
    Ok(buf.split_to(len))
}

fn get_qid(buf: &mut Bytes) -> io::Result<Qid> {
    Ok(Qid {
        typ: get_u8(buf)?,
        version: get_u32(buf)?,
        path: get_u64(buf)?,
    })
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_qid(buf: &mut BytesMut, qid: &Qid) {
    buf.put_u8(qid.typ);
    buf.put_u32_le(qid.version);
    buf.put_u64_le(qid.path);
}

impl Tmessage {
    const VERSION: u8 = 100;
    const AUTH: u8 = 102;
    const ATTACH: u8 = 104;
    const FLUSH: u8 = 108;
    const WALK: u8 = 110;
    const OPEN: u8 = 112;
    const CREATE: u8 = 114;
    const READ: u8 = 116;
    const WRITE: u8 = 118;
    const CLUNK: u8 = 120;
    const REMOVE: u8 = 122;
    const STAT: u8 = 124;
    const WSTAT: u8 = 126;

    fn decode(typ: u8, mut buf: Bytes) -> io::Result<Self> {
        let msg = match typ {
            Self::VERSION => Tmessage::Version {
                msize: get_u32(&mut buf)?,
                version: get_string(&mut buf)?,
            },
            Self::AUTH => Tmessage::Auth {
                afid: get_u32(&mut buf)?,
                uname: get_string(&mut buf)?,
                aname: get_string(&mut buf)?,
            },
            Self::ATTACH => Tmessage::Attach {
                fid: get_u32(&mut buf)?,
                afid: get_u32(&mut buf)?,
                uname: get_string(&mut buf)?,
                aname: get_string(&mut buf)?,
            },
            Self::FLUSH => Tmessage::Flush {
                oldtag: get_u16(&mut buf)?,
            },
            Self::WALK => {
                let fid = get_u32(&mut buf)?;
                let newfid = get_u32(&mut buf)?;
                let n = get_u16(&mut buf)? as usize;
                if n > MAXWELEM {
                    return Err(bad("too many walk elements"));
                }
                let mut names = Vec::with_capacity(n);
                for _ in 0..n {
                    names.push(get_string(&mut buf)?);
                }
                Tmessage::Walk { fid, newfid, names }
            }
            Self::OPEN => Tmessage::Open {
                fid: get_u32(&mut buf)?,
                mode: get_u8(&mut buf)?,
            },
            Self::CREATE => Tmessage::Create {
                fid: get_u32(&mut buf)?,
                name: get_string(&mut buf)?,
                perm: get_u32(&mut buf)?,
                mode: get_u8(&mut buf)?,
            },
            Self::READ => Tmessage::Read {
                fid: get_u32(&mut buf)?,
                offset: get_u64(&mut buf)?,
                count: get_u32(&mut buf)?,
            },
            Self::WRITE => {
                let fid = get_u32(&mut buf)?;
                let offset = get_u64(&mut buf)?;
                let count = get_u32(&mut buf)? as usize;
                let data = get_bytes(&mut buf, count)?;
                Tmessage::Write { fid, offset, data }
            }
            Self::CLUNK => Tmessage::Clunk {
                fid: get_u32(&mut buf)?,
            },
            Self::REMOVE => Tmessage::Remove {
                fid: get_u32(&mut buf)?,
            },
            Self::STAT => Tmessage::Stat {
                fid: get_u32(&mut buf)?,
            },
            Self::WSTAT => {
                let fid = get_u32(&mut buf)?;
                let _outer = get_u16(&mut buf)?;
                Tmessage::Wstat {
                    fid,
                    stat: Stat::decode(&mut buf)?,
                }
            }
            _ => return Err(bad("unknown message type")),
        };
        Ok(msg)
    }

    fn encode(&self, buf: &mut BytesMut) -> u8 {
        match self {
            Tmessage::Version { msize, version } => {
                buf.put_u32_le(*msize);
                put_string(buf, version);
                Self::VERSION
            }
            Tmessage::Auth { afid, uname, aname } => {
                buf.put_u32_le(*afid);
                put_string(buf, uname);
                put_string(buf, aname);
                Self::AUTH
            }
            Tmessage::Attach {
                fid,
                afid,
                uname,
                aname,
            } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*afid);
                put_string(buf, uname);
                put_string(buf, aname);
                Self::ATTACH
            }
            Tmessage::Flush { oldtag } => {
                buf.put_u16_le(*oldtag);
                Self::FLUSH
            }
            Tmessage::Walk { fid, newfid, names } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*newfid);
                buf.put_u16_le(names.len() as u16);
                for name in names {
                    put_string(buf, name);
                }
                Self::WALK
            }
            Tmessage::Open { fid, mode } => {
                buf.put_u32_le(*fid);
                buf.put_u8(*mode);
                Self::OPEN
            }
            Tmessage::Create {
                fid,
                name,
                perm,
                mode,
            } => {
                buf.put_u32_le(*fid);
                put_string(buf, name);
                buf.put_u32_le(*perm);
                buf.put_u8(*mode);
                Self::CREATE
            }
            Tmessage::Read { fid, offset, count } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(*count);
                Self::READ
            }
            Tmessage::Write { fid, offset, data } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
                Self::WRITE
            }
            Tmessage::Clunk { fid } => {
                buf.put_u32_le(*fid);
                Self::CLUNK
            }
            Tmessage::Remove { fid } => {
                buf.put_u32_le(*fid);
                Self::REMOVE
            }
            Tmessage::Stat { fid } => {
                buf.put_u32_le(*fid);
                Self::STAT
            }
            Tmessage::Wstat { fid, stat } => {
                buf.put_u32_le(*fid);
                let mut inner = BytesMut::new();
                stat.encode(&mut inner);
                buf.put_u16_le(inner.len() as u16);
                buf.put_slice(&inner);
                Self::WSTAT
            }
        }
    }
}

impl Rmessage {
    const VERSION: u8 = 101;
    const AUTH: u8 = 103;
    const ATTACH: u8 = 105;
    const ERROR: u8 = 107;
    const FLUSH: u8 = 109;
    const WALK: u8 = 111;
    const OPEN: u8 = 113;
    const CREATE: u8 = 115;
    const READ: u8 = 117;
    const WRITE: u8 = 119;
    const CLUNK: u8 = 121;
    const REMOVE: u8 = 123;
    const STAT: u8 = 125;
    const WSTAT: u8 = 127;

    fn encode(&self, buf: &mut BytesMut) -> u8 {
        match self {
            Rmessage::Version { msize, version } => {
                buf.put_u32_le(*msize);
                put_string(buf, version);
                Self::VERSION
            }
            Rmessage::Auth { aqid } => {
                put_qid(buf, aqid);
                Self::AUTH
            }
            Rmessage::Error { ename } => {
                put_string(buf, ename);
                Self::ERROR
            }
            Rmessage::Attach { qid } => {
                put_qid(buf, qid);
                Self::ATTACH
            }
            Rmessage::Flush => Self::FLUSH,
            Rmessage::Walk { qids } => {
                buf.put_u16_le(qids.len() as u16);
                for qid in qids {
                    put_qid(buf, qid);
                }
                Self::WALK
            }
            Rmessage::Open { qid, iounit } => {
                put_qid(buf, qid);
                buf.put_u32_le(*iounit);
                Self::OPEN
            }
            Rmessage::Create { qid, iounit } => {
                put_qid(buf, qid);
                buf.put_u32_le(*iounit);
                Self::CREATE
            }
            Rmessage::Read { data } => {
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
                Self::READ
            }
            Rmessage::Write { count } => {
                buf.put_u32_le(*count);
                Self::WRITE
            }
            Rmessage::Clunk => Self::CLUNK,
            Rmessage::Remove => Self::REMOVE,
            Rmessage::Stat { stat } => {
                let mut inner = BytesMut::new();
                stat.encode(&mut inner);
                buf.put_u16_le(inner.len() as u16);
                buf.put_slice(&inner);
                Self::STAT
            }
            Rmessage::Wstat => Self::WSTAT,
        }
    }

    fn decode(typ: u8, mut buf: Bytes) -> io::Result<Self> {
        let msg = match typ {
            Self::VERSION => Rmessage::Version {
                msize: get_u32(&mut buf)?,
                version: get_string(&mut buf)?,
            },
            Self::AUTH => Rmessage::Auth {
                aqid: get_qid(&mut buf)?,
            },
            Self::ERROR => Rmessage::Error {
                ename: get_string(&mut buf)?,
            },
            Self::ATTACH => Rmessage::Attach {
                qid: get_qid(&mut buf)?,
            },
            Self::FLUSH => Rmessage::Flush,
            Self::WALK => {
                let n = get_u16(&mut buf)? as usize;
                let mut qids = Vec::with_capacity(n);
                for _ in 0..n {
                    qids.push(get_qid(&mut buf)?);
                }
                Rmessage::Walk { qids }
            }
            Self::OPEN => Rmessage::Open {
                qid: get_qid(&mut buf)?,
                iounit: get_u32(&mut buf)?,
            },
            Self::CREATE => Rmessage::Create {
                qid: get_qid(&mut buf)?,
                iounit: get_u32(&mut buf)?,
            },
            Self::READ => {
                let count = get_u32(&mut buf)? as usize;
                Rmessage::Read {
                    data: get_bytes(&mut buf, count)?,
                }
            }
            Self::WRITE => Rmessage::Write {
                count: get_u32(&mut buf)?,
            },
            Self::CLUNK => Rmessage::Clunk,
            Self::REMOVE => Rmessage::Remove,
            Self::STAT => {
                let _outer = get_u16(&mut buf)?;
                Rmessage::Stat {
                    stat: Stat::decode(&mut buf)?,
                }
            }
            Self::WSTAT => Rmessage::Wstat,
            _ => return Err(bad("unknown message type")),
        };
        Ok(msg)
    }
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<(u8, u16, Bytes)>> {
    let size = match r.read_u32_le().await {
        Ok(size) => size,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if !(7..=MAX_MSIZE).contains(&size) {
        return Err(bad("invalid message size"));
    }
    let mut body = vec![0u8; size as usize - 4];
    r.read_exact(&mut body).await?;
    let mut body = Bytes::from(body);
    let typ = get_u8(&mut body)?;
    let tag = get_u16(&mut body)?;
    Ok(Some((typ, tag, body)))
}

async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    typ: u8,
    tag: u16,
    payload: &[u8],
) -> io::Result<()> {
    let mut head = BytesMut::with_capacity(7);
    head.put_u32_le(7 + payload.len() as u32);
    head.put_u8(typ);
    head.put_u16_le(tag);
    w.write_all(&head).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Reads one request frame; `None` on a clean disconnect.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<(u16, Tmessage)>> {
    match read_frame(r).await? {
        None => Ok(None),
        Some((typ, tag, body)) => Ok(Some((tag, Tmessage::decode(typ, body)?))),
    }
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    tag: u16,
    msg: &Rmessage,
) -> io::Result<()> {
    let mut payload = BytesMut::new();
    let typ = msg.encode(&mut payload);
    write_frame(w, typ, tag, &payload).await
}

/// Client-side halves, used by the tests that drive the dispatcher over an
/// in-memory duplex pipe.
pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    tag: u16,
    msg: &Tmessage,
) -> io::Result<()> {
    let mut payload = BytesMut::new();
    let typ = msg.encode(&mut payload);
    write_frame(w, typ, tag, &payload).await
}

pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<(u16, Rmessage)>> {
    match read_frame(r).await? {
        None => Ok(None),
        Some((typ, tag, body)) => Ok(Some((tag, Rmessage::decode(typ, body)?))),
    }
}
