//! shader 源文件的监视
//!
//! 后台线程定期扫描源目录的 mtime，变化通过有界 channel 发送给渲染线程；
//! 渲染线程在每一帧开始时取出所有事件。

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    thread::JoinHandle,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

/// channel 满时事件被丢弃，对应文件的 mtime 不进入快照，下一次扫描重新发送
pub const SHADER_EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderChangeEvent {
    pub path: PathBuf,
}

pub struct ShaderWatcher {
    event_receiver: Receiver<ShaderChangeEvent>,
    /// drop 之后监视线程退出
    stop_sender: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}
// new & init
impl ShaderWatcher {
    pub fn new(source_dir: &Path, poll_interval: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(source_dir.is_dir(), "shader source dir {} does not exist", source_dir.display());

        let (event_sender, event_receiver) = crossbeam_channel::bounded(SHADER_EVENT_CAPACITY);
        let (stop_sender, stop_receiver) = crossbeam_channel::bounded::<()>(0);

        let source_dir = source_dir.to_path_buf();
        let snapshot = scan_mtimes(&source_dir);
        log::info!("watch {} shader files under {}", snapshot.len(), source_dir.display());

        let thread = std::thread::Builder::new()
            .name("ShaderWatcher".to_string())
            .spawn(move || watch_loop(source_dir, snapshot, poll_interval, event_sender, stop_receiver))
            .context("failed to spawn shader watcher thread")?;

        Ok(Self {
            event_receiver,
            stop_sender: Some(stop_sender),
            thread: Some(thread),
        })
    }

    /// 通知线程退出并等待其结束
    pub fn stop(&mut self) {
        // sender drop 之后 recv_timeout 立即返回 Disconnected
        self.stop_sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("shader watcher thread panicked");
            }
        }
    }
}
impl Drop for ShaderWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
// update
impl ShaderWatcher {
    /// 取出所有已经到达的事件，不阻塞
    pub fn drain(&self) -> Vec<ShaderChangeEvent> {
        self.event_receiver.try_iter().collect()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

fn scan_mtimes(dir: &Path) -> HashMap<PathBuf, SystemTime> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.into_path(), modified))
        })
        .collect()
}

/// 将 `current` 中相对 `snapshot` 变化的文件发送出去，并更新快照
///
/// 只有发送成功的文件才会记录新的 mtime；已删除的文件从快照中移除。
/// return: 接收端已经断开时返回 Err
fn send_changes(
    snapshot: &mut HashMap<PathBuf, SystemTime>,
    current: HashMap<PathBuf, SystemTime>,
    event_sender: &Sender<ShaderChangeEvent>,
) -> Result<(), ()> {
    let mut next = HashMap::with_capacity(current.len());
    for (path, modified) in current {
        let previous = snapshot.remove(&path);
        if previous == Some(modified) {
            next.insert(path, modified);
            continue;
        }
        log::debug!("shader changed: {}", path.display());
        match event_sender.try_send(ShaderChangeEvent { path: path.clone() }) {
            Ok(()) => {
                next.insert(path, modified);
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("shader event queue is full, retry {} next poll", path.display());
                if let Some(previous) = previous {
                    next.insert(path, previous);
                }
            }
            Err(TrySendError::Disconnected(_)) => return Err(()),
        }
    }
    *snapshot = next;
    Ok(())
}

fn watch_loop(
    source_dir: PathBuf,
    mut snapshot: HashMap<PathBuf, SystemTime>,
    poll_interval: Duration,
    event_sender: Sender<ShaderChangeEvent>,
    stop_receiver: Receiver<()>,
) {
    loop {
        match stop_receiver.recv_timeout(poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let current = scan_mtimes(&source_dir);
        if send_changes(&mut snapshot, current, &event_sender).is_err() {
            return;
        }
    }
    log::debug!("shader watcher stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn wait_for_events(watcher: &ShaderWatcher, timeout: Duration) -> Vec<ShaderChangeEvent> {
        let start = Instant::now();
        loop {
            let events = watcher.drain();
            if !events.is_empty() || start.elapsed() > timeout {
                return events;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_new_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mip_gen.comp"), "#version 460").unwrap();

        let mut watcher = ShaderWatcher::new(dir.path(), Duration::from_millis(10)).unwrap();
        assert!(watcher.drain().is_empty());

        let new_shader = dir.path().join("shadow.comp");
        std::fs::write(&new_shader, "#version 460").unwrap();
        let events = wait_for_events(&watcher, Duration::from_secs(5));
        assert_eq!(events, vec![ShaderChangeEvent { path: new_shader }]);

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_full_queue_retries_dropped_changes() {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(1);

        let mut snapshot = HashMap::from([(PathBuf::from("a.comp"), t0), (PathBuf::from("b.comp"), t0)]);
        let current = HashMap::from([(PathBuf::from("a.comp"), t1), (PathBuf::from("b.comp"), t1)]);

        // 只能放下一个事件
        send_changes(&mut snapshot, current.clone(), &sender).unwrap();
        let first = receiver.try_recv().unwrap().path;
        assert!(receiver.try_recv().is_err());
        assert_eq!(snapshot[&first], t1);

        // 被丢弃的那个在下一次扫描中重新发送
        send_changes(&mut snapshot, current.clone(), &sender).unwrap();
        let second = receiver.try_recv().unwrap().path;
        assert_ne!(first, second);
        assert_eq!(snapshot, current);

        // 没有新的变化
        send_changes(&mut snapshot, current, &sender).unwrap();
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_retries_new_files() {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let t0 = SystemTime::UNIX_EPOCH;
        let mut snapshot = HashMap::new();
        let current = HashMap::from([(PathBuf::from("a.comp"), t0), (PathBuf::from("b.comp"), t0)]);

        send_changes(&mut snapshot, current.clone(), &sender).unwrap();
        assert_eq!(snapshot.len(), 1);
        receiver.try_recv().unwrap();

        send_changes(&mut snapshot, current.clone(), &sender).unwrap();
        receiver.try_recv().unwrap();
        assert_eq!(snapshot, current);
    }

    #[test]
    fn test_stop_joins_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = ShaderWatcher::new(dir.path(), Duration::from_secs(60)).unwrap();
        let start = Instant::now();
        watcher.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShaderWatcher::new(&dir.path().join("missing"), Duration::from_millis(10)).is_err());
    }
}
