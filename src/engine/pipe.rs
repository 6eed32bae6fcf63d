use std::collections::HashSet;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use nix::fcntl::OFlag;
use nix::libc;
use nix::unistd::pipe2;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;

use crate::engine::cmd::{Cmd, ExecDefaults, PipeSpec, RequestFile};
use crate::filestore::FileStore;

/// Concrete descriptors for one command plus the host-side tasks that must
/// run alongside it.
pub struct PreparedCmd {
    pub fds: Vec<OwnedFd>,
    pub feeds: Vec<InputFeed>,
    pub collectors: Vec<Collector>,
}

/// Streams prepared bytes into a child read end; dropping the sender closes
/// the pipe.
pub struct InputFeed {
    tx: pipe::Sender,
    bytes: Bytes,
}

/// Drains a child write end into a size-capped buffer.
pub struct Collector {
    name: String,
    max: u64,
    rx: pipe::Receiver,
}

#[derive(Debug)]
pub struct Collected {
    pub name: String,
    pub bytes: Vec<u8>,
    pub overflow: bool,
}

/// Structural checks shared by the transport layer and the engine: indices
/// in range, source and sink distinct, every endpoint unique and aimed at a
/// `None` placeholder.
pub fn validate_pipes(cmds: &[Cmd], pipes: &[PipeSpec]) -> Result<()> {
    let mut used = HashSet::new();
    for pipe in pipes {
        if pipe.from_index == pipe.to_index {
            bail!("pipe source and sink must be distinct commands");
        }
        for (index, fd) in [
            (pipe.from_index, pipe.from_fd),
            (pipe.to_index, pipe.to_fd),
        ] {
            let cmd = cmds
                .get(index)
                .with_context(|| format!("pipe references command {index} out of range"))?;
            let entry = cmd.files.get(fd).with_context(|| {
                format!("pipe references fd {fd} beyond command {index} descriptors")
            })?;
            if entry.is_some() {
                bail!("pipe endpoint ({index},{fd}) is not a placeholder");
            }
            if !used.insert((index, fd)) {
                bail!("pipe endpoint ({index},{fd}) used more than once");
            }
        }
    }
    Ok(())
}

/// Turns the descriptor specs of a group into OS pipes, direct fds, input
/// feeds and bounded collectors. Every opened fd ends up uniquely owned in
/// the returned structures.
pub async fn prepare(
    cmds: &[Cmd],
    pipes: &[PipeSpec],
    store: &Arc<dyn FileStore>,
    defaults: &ExecDefaults,
) -> Result<Vec<PreparedCmd>> {
    validate_pipes(cmds, pipes)?;

    let mut slots: Vec<Vec<Option<OwnedFd>>> = cmds
        .iter()
        .map(|cmd| (0..cmd.files.len()).map(|_| None).collect())
        .collect();

    for spec in pipes {
        let (read_end, write_end) = os_pipe()?;
        slots[spec.to_index][spec.to_fd] = Some(read_end);
        slots[spec.from_index][spec.from_fd] = Some(write_end);
    }

    let mut prepared = Vec::with_capacity(cmds.len());
    for (index, cmd) in cmds.iter().enumerate() {
        let mut feeds = Vec::new();
        let mut collectors = Vec::new();

        for (fd, entry) in cmd.files.iter().enumerate() {
            if slots[index][fd].is_some() {
                continue;
            }
            let owned = match entry {
                None => dev_null()?,
                Some(RequestFile::Local { src }) => std::fs::File::open(src)
                    .map(OwnedFd::from)
                    .with_context(|| format!("open {}", src.display()))?,
                Some(RequestFile::Memory { content }) => {
                    let (read_end, write_end) = os_pipe()?;
                    feeds.push(InputFeed {
                        tx: sender(write_end)?,
                        bytes: Bytes::copy_from_slice(content.as_bytes()),
                    });
                    read_end
                }
                Some(RequestFile::Cached { file_id }) => {
                    let (_, bytes) = store
                        .get(file_id)
                        .await
                        .with_context(|| format!("unknown file id {file_id}"))?;
                    let (read_end, write_end) = os_pipe()?;
                    feeds.push(InputFeed {
                        tx: sender(write_end)?,
                        bytes,
                    });
                    read_end
                }
                Some(RequestFile::Collector { name, max }) => {
                    let (read_end, write_end) = os_pipe()?;
                    collectors.push(Collector {
                        name: name.clone(),
                        max: max.unwrap_or(defaults.output_limit),
                        rx: receiver(read_end)?,
                    });
                    write_end
                }
            };
            slots[index][fd] = Some(owned);
        }

        let fds = std::mem::take(&mut slots[index])
            .into_iter()
            .map(|slot| slot.expect("descriptor slot filled"))
            .collect();
        prepared.push(PreparedCmd {
            fds,
            feeds,
            collectors,
        });
    }
    Ok(prepared)
}

/// Drains the pipe until EOF. At most `max` bytes are kept; everything past
/// the cap is discarded so the producer never blocks on a full pipe, and the
/// overflow is reported for the status mapper.
pub async fn collect(collector: Collector) -> Collected {
    let Collector { name, max, mut rx } = collector;
    let mut bytes = Vec::with_capacity((max as usize).min(8192));
    let mut total: u64 = 0;
    let mut chunk = [0u8; 8192];
    loop {
        match rx.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if (bytes.len() as u64) < max {
                    let take = ((max - bytes.len() as u64) as usize).min(n);
                    bytes.extend_from_slice(&chunk[..take]);
                }
            }
            Err(_) => break,
        }
    }
    Collected {
        name,
        bytes,
        overflow: total > max,
    }
}

/// Writes the prepared bytes and closes the write end. A child that exits
/// early surfaces as a broken pipe here, which is not an error of ours.
pub async fn feed(feed: InputFeed) {
    let InputFeed { mut tx, bytes } = feed;
    let _ = tx.write_all(&bytes).await;
}

fn os_pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).context("create pipe")
}

fn dev_null() -> Result<OwnedFd> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map(OwnedFd::from)
        .context("open /dev/null")
}

fn sender(fd: OwnedFd) -> Result<pipe::Sender> {
    set_nonblocking(&fd)?;
    pipe::Sender::from_owned_fd(fd).context("wrap pipe write end")
}

fn receiver(fd: OwnedFd) -> Result<pipe::Receiver> {
    set_nonblocking(&fd)?;
    pipe::Receiver::from_owned_fd(fd).context("wrap pipe read end")
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        bail!("F_GETFL: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        bail!("F_SETFL: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cmd::Cmd;

    fn cmd_with_placeholders(n: usize) -> Cmd {
        Cmd {
            args: vec!["/bin/true".into()],
            files: (0..n).map(|_| None).collect(),
            ..Cmd::default()
        }
    }

    fn spec(from: (usize, usize), to: (usize, usize)) -> PipeSpec {
        PipeSpec {
            from_index: from.0,
            from_fd: from.1,
            to_index: to.0,
            to_fd: to.1,
        }
    }

    #[test]
    fn validate_accepts_well_formed_graphs() {
        let cmds = vec![cmd_with_placeholders(2), cmd_with_placeholders(2)];
        let pipes = vec![spec((1, 1), (0, 0))];
        assert!(validate_pipes(&cmds, &pipes).is_ok());
    }

    #[test]
    fn validate_rejects_self_pipes() {
        let cmds = vec![cmd_with_placeholders(2)];
        assert!(validate_pipes(&cmds, &[spec((0, 1), (0, 0))]).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_and_duplicates() {
        let cmds = vec![cmd_with_placeholders(2), cmd_with_placeholders(2)];
        assert!(validate_pipes(&cmds, &[spec((2, 1), (0, 0))]).is_err());
        assert!(validate_pipes(&cmds, &[spec((1, 5), (0, 0))]).is_err());
        assert!(validate_pipes(
            &cmds,
            &[spec((1, 1), (0, 0)), spec((1, 1), (0, 1))]
        )
        .is_err());
    }

    #[test]
    fn validate_rejects_non_placeholder_endpoints() {
        let mut sink = cmd_with_placeholders(1);
        sink.files[0] = Some(RequestFile::Memory {
            content: "x".into(),
        });
        let cmds = vec![sink, cmd_with_placeholders(2)];
        assert!(validate_pipes(&cmds, &[spec((1, 1), (0, 0))]).is_err());
    }

    #[tokio::test]
    async fn collector_caps_bytes_and_flags_overflow() {
        let (read_end, write_end) = os_pipe().unwrap();
        let collector = Collector {
            name: "stdout".into(),
            max: 1024,
            rx: receiver(read_end).unwrap(),
        };

        let writer = tokio::spawn(async move {
            let mut tx = sender(write_end).unwrap();
            tx.write_all(&vec![b'x'; 4096]).await.unwrap();
        });
        let collected = collect(collector).await;
        writer.await.unwrap();

        assert_eq!(collected.bytes.len(), 1024);
        assert!(collected.overflow);
    }

    #[tokio::test]
    async fn collector_keeps_everything_under_the_cap() {
        let (read_end, write_end) = os_pipe().unwrap();
        let collector = Collector {
            name: "stdout".into(),
            max: 1024,
            rx: receiver(read_end).unwrap(),
        };

        let writer = tokio::spawn(async move {
            let mut tx = sender(write_end).unwrap();
            tx.write_all(b"hello").await.unwrap();
        });
        let collected = collect(collector).await;
        writer.await.unwrap();

        assert_eq!(collected.bytes, b"hello");
        assert!(!collected.overflow);
    }

    #[tokio::test]
    async fn feed_delivers_bytes_then_eof() {
        let (read_end, write_end) = os_pipe().unwrap();
        let input = InputFeed {
            tx: sender(write_end).unwrap(),
            bytes: Bytes::from_static(b"payload"),
        };
        let feeder = tokio::spawn(feed(input));

        let mut rx = receiver(read_end).unwrap();
        let mut buffer = Vec::new();
        rx.read_to_end(&mut buffer).await.unwrap();
        feeder.await.unwrap();
        assert_eq!(buffer, b"payload");
    }

    #[tokio::test]
    async fn prepare_wires_feeds_and_collectors() {
        let store: Arc<dyn FileStore> = Arc::new(crate::filestore::MemoryStore::new());
        let defaults = ExecDefaults {
            output_limit: 4096,
            copy_out_limit: 4096,
        };
        let mut cmd = cmd_with_placeholders(0);
        cmd.files = vec![
            Some(RequestFile::Memory {
                content: "input".into(),
            }),
            Some(RequestFile::Collector {
                name: "stdout".into(),
                max: None,
            }),
            None,
        ];
        let prepared = prepare(&[cmd], &[], &store, &defaults).await.unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].fds.len(), 3);
        assert_eq!(prepared[0].feeds.len(), 1);
        assert_eq!(prepared[0].collectors.len(), 1);
        assert_eq!(prepared[0].collectors[0].max, 4096);
    }

    #[tokio::test]
    async fn prepare_rejects_unknown_file_ids() {
        let store: Arc<dyn FileStore> = Arc::new(crate::filestore::MemoryStore::new());
        let defaults = ExecDefaults {
            output_limit: 4096,
            copy_out_limit: 4096,
        };
        let mut cmd = cmd_with_placeholders(0);
        cmd.files = vec![Some(RequestFile::Cached {
            file_id: "missing".into(),
        })];
        assert!(prepare(&[cmd], &[], &store, &defaults).await.is_err());
    }
}
