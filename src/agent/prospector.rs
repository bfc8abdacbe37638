//! Prospector - 文件发现与生命周期
//!
//! 定期展开 glob，为每个文件按身份（device + index）决定：
//! - 已知身份：Harvester 还在跑就不动；已停下则视退出原因重新拉起
//! - 路径换了身份（轮转）：新文件从 0 开始，旧 Harvester 读完后自行退出
//! - 新路径的身份属于已跟踪的文件（重命名）：接管原来的位置，不重复读
//! - 首轮扫描时路径在状态表中没有对应记录：按身份查找停机前记录的位置
//!
//! 首轮扫描为每个启动的文件上报一次状态，随后发送 `StartupReport::Done`。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::harvester::{stopped, HarvestExit, HarvestReport, Harvester, HarvesterOptions};
use crate::config::{FileConfig, Options};
use crate::types::{DataEvent, Fields, FileIdentity, FileState, StartupReport, StateTable};

/// glob 展开得到的文件
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    identity: FileIdentity,
    size: u64,
}

#[derive(Debug)]
enum Status {
    Running,
    Stopped {
        offset: u64,
        line: u64,
        exit: HarvestExit,
    },
}

/// 某个路径当前对应的文件
#[derive(Debug)]
struct Tracked {
    identity: FileIdentity,
    status: Status,
    /// 最后一次被 glob 匹配到
    last_seen: Instant,
}

/// 已离开原路径的文件的读取位置，等待被新路径接管
#[derive(Debug)]
struct Retired {
    offset: u64,
    line: u64,
    since: Instant,
}

/// Harvester 共用的通道
struct Links {
    events: mpsc::Sender<DataEvent>,
    exits: mpsc::Sender<HarvestReport>,
    shutdown: watch::Receiver<bool>,
}

/// 单个 file 配置块的 Prospector
pub struct Prospector {
    paths: Vec<String>,
    fields: Fields,
    dead_time: Duration,
    interval: Duration,
    harvester: HarvesterOptions,
    /// 上次运行留下的状态，只在首轮使用
    resume: StateTable,
    tracked: HashMap<PathBuf, Tracked>,
    /// 有 Harvester 在读的文件
    running: HashSet<FileIdentity>,
    retired: HashMap<FileIdentity, Retired>,
}

impl Prospector {
    pub fn new(config: &FileConfig, resume: StateTable, options: &Options) -> Self {
        let dead_time = config.dead_time();
        Self {
            paths: config.paths.clone(),
            fields: Arc::new(config.fields.clone()),
            dead_time,
            interval: options.prospect_interval,
            harvester: HarvesterOptions {
                buffer_size: options.harvester_buffer_size,
                tail_on_rotate: options.tail_on_rotate,
                dead_time,
                ..Default::default()
            },
            resume,
            tracked: HashMap::new(),
            running: HashSet::new(),
            retired: HashMap::new(),
        }
    }

    /// 运行直到收到停止信号
    pub async fn run(
        mut self,
        reports: mpsc::Sender<StartupReport>,
        events: mpsc::Sender<DataEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (exits_tx, mut exits) = mpsc::channel(64);
        let links = Links {
            events,
            exits: exits_tx,
            shutdown: shutdown.clone(),
        };

        let started = self.scan(&links).await;
        tracing::info!(
            "Prospector for {:?} started {} harvesters",
            self.paths,
            started.len()
        );
        for state in started {
            if reports.send(StartupReport::State(state)).await.is_err() {
                tracing::warn!("Startup report channel closed");
                break;
            }
        }
        let _ = reports.send(StartupReport::Done).await;
        drop(reports);
        self.resume.clear();

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                Some(report) = exits.recv() => self.on_exit(report),
                _ = ticker.tick() => {
                    self.scan(&links).await;
                }
            }
        }

        tracing::info!("Prospector for {:?} stopped", self.paths);
    }

    /// 扫描一轮，返回本轮启动的 Harvester 的起始状态
    async fn scan(&mut self, links: &Links) -> Vec<FileState> {
        let patterns = self.paths.clone();
        let candidates = match tokio::task::spawn_blocking(move || expand(&patterns)).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!("Glob expansion for {:?} failed: {}", self.paths, e);
                return Vec::new();
            }
        };

        let now = Instant::now();
        let mut started = Vec::new();
        for candidate in candidates {
            if let Some(state) = self.consider(candidate, now, links) {
                started.push(state);
            }
        }
        self.expire(now);
        started
    }

    fn consider(&mut self, candidate: Candidate, now: Instant, links: &Links) -> Option<FileState> {
        let Candidate {
            path,
            identity,
            size,
        } = candidate;

        if let Some(tracked) = self.tracked.get_mut(&path) {
            tracked.last_seen = now;
            if tracked.identity == identity {
                let (offset, line) = match &tracked.status {
                    Status::Running => return None,
                    Status::Stopped {
                        exit: HarvestExit::Idle,
                        offset,
                        ..
                    } if size == *offset => return None,
                    Status::Stopped {
                        exit: HarvestExit::Truncated,
                        ..
                    } => (0, 0),
                    Status::Stopped { offset, .. } if size < *offset => (0, 0),
                    Status::Stopped { offset, line, .. } => (*offset, *line),
                };
                tracing::info!("Resuming {} at offset {}", path.display(), offset);
                return Some(self.start(path, identity, offset, line, links));
            }

            tracing::info!(
                "{} now points at a new file ({} -> {})",
                path.display(),
                tracked.identity,
                identity
            );
            if let Some(old) = self.tracked.remove(&path) {
                if let Status::Stopped { offset, line, .. } = old.status {
                    self.retire(old.identity, offset, line, now);
                }
            }
        }

        if self.running.contains(&identity) {
            tracing::debug!("{} is already being harvested under another path", path.display());
            return None;
        }

        let (offset, line) = self
            .adopt(&path, &identity)
            .or_else(|| self.resume_point(&path, &identity, size))
            .unwrap_or((0, 0));

        tracing::info!("Launching harvester on {} at offset {}", path.display(), offset);
        Some(self.start(path, identity, offset, line, links))
    }

    /// 查找同一文件在别的路径下留下的位置
    fn adopt(&mut self, path: &Path, identity: &FileIdentity) -> Option<(u64, u64)> {
        let moved_from = self
            .tracked
            .iter()
            .find(|(_, t)| t.identity == *identity && matches!(t.status, Status::Stopped { .. }))
            .map(|(p, _)| p.clone());

        if let Some(from) = moved_from {
            if let Some(Tracked {
                status: Status::Stopped { offset, line, .. },
                ..
            }) = self.tracked.remove(&from)
            {
                tracing::info!("{} was renamed to {}", from.display(), path.display());
                return Some((offset, line));
            }
        }

        self.retired.remove(identity).map(|r| {
            tracing::info!("Adopting renamed file {} at offset {}", path.display(), r.offset);
            (r.offset, r.line)
        })
    }

    /// 上次运行留下的位置
    ///
    /// 先按路径找；路径下已换了文件时按标识找，文件可能在停机期间被改名。
    fn resume_point(&self, path: &Path, identity: &FileIdentity, size: u64) -> Option<(u64, u64)> {
        if let Some(state) = self.resume.get(&*path.to_string_lossy()) {
            match state.identity {
                Some(known) if known != *identity => {
                    tracing::info!("{} was replaced while stopped", path.display());
                }
                _ => return Some((state.offset, state.line)),
            }
        }

        let state = self
            .resume
            .values()
            .filter(|s| s.identity == Some(*identity) && s.offset <= size)
            .max_by_key(|s| s.offset)?;
        tracing::info!(
            "{} was previously recorded as {}, resuming at offset {}",
            path.display(),
            state.source,
            state.offset
        );
        Some((state.offset, state.line))
    }

    fn start(
        &mut self,
        path: PathBuf,
        identity: FileIdentity,
        offset: u64,
        line: u64,
        links: &Links,
    ) -> FileState {
        let state = FileState::new(path.to_string_lossy(), Some(identity)).at(offset, line);

        self.tracked.insert(
            path.clone(),
            Tracked {
                identity,
                status: Status::Running,
                last_seen: Instant::now(),
            },
        );
        self.running.insert(identity);

        let harvester = Harvester::new(
            path.clone(),
            identity,
            offset,
            line,
            self.fields.clone(),
            self.harvester.clone(),
        );
        let task = tokio::spawn(harvester.harvest(links.events.clone(), links.shutdown.clone()));

        // 单独等待 Harvester，panic 也能报告回来
        let exits = links.exits.clone();
        tokio::spawn(async move {
            let report = match task.await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!("Lost harvester for {}: {}", path.display(), e);
                    HarvestReport {
                        path,
                        identity,
                        offset,
                        line,
                        exit: HarvestExit::Failed(e.to_string()),
                    }
                }
            };
            let _ = exits.send(report).await;
        });

        state
    }

    fn on_exit(&mut self, report: HarvestReport) {
        self.running.remove(&report.identity);
        if report.exit == HarvestExit::Shutdown {
            return;
        }

        match self.tracked.get_mut(&report.path) {
            Some(tracked) if tracked.identity == report.identity => {
                tracked.status = Status::Stopped {
                    offset: report.offset,
                    line: report.line,
                    exit: report.exit,
                };
            }
            _ => self.retire(report.identity, report.offset, report.line, Instant::now()),
        }
    }

    fn retire(&mut self, identity: FileIdentity, offset: u64, line: u64, now: Instant) {
        self.retired.insert(
            identity,
            Retired {
                offset,
                line,
                since: now,
            },
        );
    }

    /// 丢弃超过 dead time 未匹配的路径
    fn expire(&mut self, now: Instant) {
        let dead_time = self.dead_time;
        self.tracked.retain(|path, tracked| {
            let keep = now.duration_since(tracked.last_seen) <= dead_time;
            if !keep {
                tracing::info!("Forgetting {}: not seen for {:?}", path.display(), dead_time);
            }
            keep
        });
        self.retired
            .retain(|_, retired| now.duration_since(retired.since) <= dead_time);
    }
}

/// 展开所有 glob，只保留普通文件
fn expand(patterns: &[String]) -> Vec<Candidate> {
    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();

    for pattern in patterns {
        let entries = match glob::glob(pattern) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Invalid glob pattern {}: {}", pattern, e);
                continue;
            }
        };

        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", e.path().display(), e.error());
                    continue;
                }
            };
            if !seen.insert(path.clone()) {
                continue;
            }

            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            match FileIdentity::of(&path) {
                Ok(identity) => candidates.push(Candidate {
                    path,
                    identity,
                    size: metadata.len(),
                }),
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
    }

    candidates
}
