pub use crate::adjustments::Adjustments;
pub use crate::buffers::OverflowBuffer;
pub use crate::channel::ChannelCore;
pub use crate::interfaces::{ByteSink, HitLog, HitRecord, Resolver};
pub use crate::reactor::{EventHandler, EventLoop, Reactor};
pub use crate::serverbase::{ServerBase, ServerChannel};
pub use crate::taskthreads::{Task, ThreadedTaskDispatcher};
pub use crate::trigger::Trigger;

pub use mio::net::{TcpListener, TcpStream};
pub use mio::{Interest, Token};

pub use parking_lot::{Mutex, RwLock};

pub use std::collections::{HashMap, VecDeque};
pub use std::io::{self, ErrorKind, Read, Write};
pub use std::net::SocketAddr;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};
