//! Turning part records back into engine tasks.

use std::path::Path;
use std::sync::Arc;

use super::model::{Direction, JobModel, TaskModel};
use super::part::JobPart;
use super::{HydrationParameters, PlanSettings};
use crate::error::PlanError;
use crate::journal::PartRecord;
use crate::remote::RemoteStore;
use crate::task::{
    BlockUpload, DownloadRange, RangedDownload, ReadFileRange, ServerCopy, StartCopy, Task,
    TaskBody, TaskClass, TaskSharedStatus, UploadObject,
};

pub(crate) struct Hydrator<'a> {
    pub model: &'a JobModel,
    pub direction: Direction,
    pub params: &'a HydrationParameters,
    pub settings: &'a PlanSettings,
    pub status: &'a Arc<TaskSharedStatus>,
}

fn store<'s>(
    store: &'s Option<Arc<dyn RemoteStore>>,
    side: &str,
) -> Result<&'s Arc<dyn RemoteStore>, PlanError> {
    store
        .as_ref()
        .ok_or_else(|| PlanError::Invalid(format!("no {side} store supplied")))
}

impl Hydrator<'_> {
    /// Tasks for every undone subtask of `part`. Subtasks resolved without a
    /// task (skipped downloads) are journaled here.
    pub fn hydrate(
        &self,
        part: &Arc<JobPart>,
        records: &[PartRecord],
    ) -> Result<Vec<Task>, PlanError> {
        let path = part.path().unwrap_or(Path::new(""));
        let mut tasks = Vec::new();
        let mut base = 0usize;
        for record in records {
            let n = record.num_subtasks as usize;
            let mut tm: TaskModel = serde_json::from_str(&record.payload)
                .map_err(|e| PlanError::corrupt(path, format!("bad task record: {e}")))?;
            if tm.num_subtasks() as usize != n {
                return Err(PlanError::corrupt(
                    path,
                    format!(
                        "{} claims {n} subtasks but its model has {}",
                        tm.source,
                        tm.num_subtasks()
                    ),
                ));
            }
            let done = part.bitmap().snapshot(base, n);
            if done.iter().all(|&d| d) {
                base += n;
                continue;
            }
            if done.iter().any(|&d| d) {
                tm.set_done_chunks(&done);
            }
            match self.direction {
                Direction::Upload => self.upload(part, base, &tm, &mut tasks)?,
                Direction::Download => self.download(part, base, &tm, &mut tasks)?,
                Direction::Copy => self.copy(part, base, &tm, &mut tasks)?,
            }
            base += n;
        }
        Ok(tasks)
    }

    fn urls(&self, tm: &TaskModel) -> (String, String) {
        (
            self.model.source.child_url(&tm.source),
            self.model.destination.child_url(&tm.destination),
        )
    }

    fn upload(
        &self,
        part: &Arc<JobPart>,
        base: usize,
        tm: &TaskModel,
        out: &mut Vec<Task>,
    ) -> Result<(), PlanError> {
        let store = store(&self.params.destination_store, "destination")?;
        let source = self.model.source.local_child(&tm.source)?;
        let name = self.model.destination.remote_child(&tm.destination)?;
        let (source_url, destination_url) = self.urls(tm);
        let num_blocks = tm.num_subtasks();

        if num_blocks == 1 {
            let body = TaskBody::UploadObject(UploadObject {
                source,
                store: Arc::clone(store),
                name,
                size: tm.object_size,
                retry: self.settings.retry,
                source_url,
                destination_url,
            });
            out.push(
                Task::new(TaskClass::NetworkUpload, tm.object_size, Arc::clone(self.status), body)
                    .with_journal(part.journal(base)),
            );
            return Ok(());
        }

        let done = tm.done_chunks();
        let staged = done.iter().filter(|&&d| d).count() as u32;
        let upload = Arc::new(BlockUpload::new(
            source,
            Arc::clone(store),
            name,
            tm.object_size,
            tm.chunk_size,
            num_blocks,
            staged,
            self.settings.retry,
            source_url,
            destination_url,
        ));
        for (i, _) in done.iter().enumerate().filter(|(_, &d)| !d) {
            let block = i as u32;
            let (_, len) = upload.block_range(block);
            let body = TaskBody::ReadFileRange(ReadFileRange {
                upload: Arc::clone(&upload),
                block,
            });
            out.push(
                Task::new(TaskClass::DiskIo, len, Arc::clone(self.status), body)
                    .with_journal(part.journal(base + i)),
            );
        }
        Ok(())
    }

    fn download(
        &self,
        part: &Arc<JobPart>,
        base: usize,
        tm: &TaskModel,
        out: &mut Vec<Task>,
    ) -> Result<(), PlanError> {
        let store = store(&self.params.source_store, "source")?;
        let destination = self.model.destination.local_child(&tm.destination)?;
        let done = tm.done_chunks();
        let already = done.iter().filter(|&&d| d).count() as u32;

        if !self.params.overwrite && already == 0 && destination.exists() {
            tracing::debug!(destination = %destination.display(), "destination exists, skipping");
            self.status.file_skipped(Some(part.journal(base)));
            for i in 1..done.len() {
                let journal = part.journal(base + i);
                journal.mark_done();
                journal.resolve();
            }
            return Ok(());
        }

        let name = self.model.source.remote_child(&tm.source)?;
        let (source_url, destination_url) = self.urls(tm);
        let download = Arc::new(RangedDownload::new(
            Arc::clone(store),
            name,
            destination,
            tm.object_size,
            tm.chunk_size,
            tm.num_subtasks(),
            already,
            self.settings.retry,
            source_url,
            destination_url,
        ));
        for (i, _) in done.iter().enumerate().filter(|(_, &d)| !d) {
            let chunk = i as u32;
            let (_, len) = download.chunk_range(chunk);
            let body = TaskBody::DownloadRange(DownloadRange {
                download: Arc::clone(&download),
                chunk,
            });
            out.push(
                Task::new(TaskClass::NetworkDownload, len, Arc::clone(self.status), body)
                    .with_journal(part.journal(base + i)),
            );
        }
        Ok(())
    }

    fn copy(
        &self,
        part: &Arc<JobPart>,
        base: usize,
        tm: &TaskModel,
        out: &mut Vec<Task>,
    ) -> Result<(), PlanError> {
        let source = store(&self.params.source_store, "source")?;
        let destination = store(&self.params.destination_store, "destination")?;
        let (source_url, destination_url) = self.urls(tm);
        let copy = Arc::new(ServerCopy {
            source: Arc::clone(source),
            source_name: self.model.source.remote_child(&tm.source)?,
            destination: Arc::clone(destination),
            destination_name: self.model.destination.remote_child(&tm.destination)?,
            size: tm.object_size,
            retry: self.settings.retry,
            poll_interval: self.settings.copy_poll_interval,
            source_url,
            destination_url,
        });
        let body = TaskBody::StartCopy(StartCopy { copy });
        out.push(
            Task::new(TaskClass::NetworkUpload, 0, Arc::clone(self.status), body)
                .with_journal(part.journal(base)),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::DoneBitmap;
    use crate::plan::{PartDoneHook, TransferEnd};
    use crate::remote::LocalDirStore;
    use std::sync::Mutex;

    fn record(tm: &TaskModel) -> PartRecord {
        PartRecord {
            num_subtasks: tm.num_subtasks(),
            payload: serde_json::to_string(tm).unwrap(),
        }
    }

    fn settings() -> PlanSettings {
        PlanSettings::default()
    }

    #[test]
    fn partially_done_upload_hydrates_remaining_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RemoteStore> =
            Arc::new(LocalDirStore::open(dir.path().join("store")).unwrap());
        let job = JobModel {
            source: TransferEnd::local_directory(dir.path()).unwrap(),
            destination: TransferEnd::remote_folder(store.as_ref(), "up"),
        };
        let params = HydrationParameters {
            destination_store: Some(store),
            ..Default::default()
        };
        let status = TaskSharedStatus::new("job");
        let settings = settings();
        let hydrator = Hydrator {
            model: &job,
            direction: Direction::Upload,
            params: &params,
            settings: &settings,
            status: &status,
        };

        let small = TaskModel::new("s".into(), "s".into(), 3, 4);
        let big = TaskModel::new("b".into(), "b".into(), 10, 4);
        let bitmap = DoneBitmap::anonymous(4).unwrap();
        bitmap.set(2);
        let part = JobPart::new("job", 0, None, bitmap, Arc::new(|_: &str, _: u32| {}));

        let tasks = hydrator.hydrate(&part, &[record(&small), record(&big)]).unwrap();
        let shape: Vec<(&str, TaskClass, u64, usize)> = tasks
            .iter()
            .map(|t| {
                (
                    t.body().name(),
                    t.class(),
                    t.memory_cost(),
                    t.journal().map(|j| j.offset()).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                ("upload_object", TaskClass::NetworkUpload, 3, 0),
                ("read_file_range", TaskClass::DiskIo, 4, 1),
                ("read_file_range", TaskClass::DiskIo, 2, 3),
            ]
        );
    }

    #[test]
    fn existing_download_destination_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RemoteStore> =
            Arc::new(LocalDirStore::open(dir.path().join("store")).unwrap());
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("x"), b"old").unwrap();

        let job = JobModel {
            source: TransferEnd::remote_folder(store.as_ref(), "p"),
            destination: TransferEnd::local_directory(&out).unwrap(),
        };
        let mut params = HydrationParameters {
            source_store: Some(store),
            ..Default::default()
        };
        let status = TaskSharedStatus::new("job");
        let settings = settings();
        let settled = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&settled);
        let hook: PartDoneHook = Arc::new(move |_: &str, _: u32| *sink.lock().unwrap() += 1);

        let x = TaskModel::new("x".into(), "x".into(), 10, 4);
        let y = TaskModel::new("y".into(), "y".into(), 4, 4);
        let part = JobPart::new("job", 0, None, DoneBitmap::anonymous(4).unwrap(), hook);

        let tasks = Hydrator {
            model: &job,
            direction: Direction::Download,
            params: &params,
            settings: &settings,
            status: &status,
        }
        .hydrate(&part, &[record(&x), record(&y)])
        .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].body().name(), "download_range");
        assert_eq!(status.progress().files_skipped, 1);
        assert_eq!(part.unresolved(), 1);
        assert!(part.bitmap().snapshot(0, 3).iter().all(|&d| d));
        assert_eq!(*settled.lock().unwrap(), 0);

        params.overwrite = true;
        let part = JobPart::anonymous("job", 1, 3).unwrap();
        let tasks = Hydrator {
            model: &job,
            direction: Direction::Download,
            params: &params,
            settings: &settings,
            status: &status,
        }
        .hydrate(&part, &[record(&x)])
        .unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].memory_cost(), 2);
    }

    #[test]
    fn mismatched_record_is_corrupt() {
        let status = TaskSharedStatus::new("job");
        let job = JobModel {
            source: TransferEnd::LocalFile {
                url: "file:///tmp/a".into(),
            },
            destination: TransferEnd::RemoteObject {
                url: "mem://a".into(),
                name: "a".into(),
            },
        };
        let params = HydrationParameters::default();
        let settings = settings();
        let part = JobPart::anonymous("job", 0, 2).unwrap();
        let bad = PartRecord {
            num_subtasks: 2,
            payload: serde_json::to_string(&TaskModel::new(String::new(), String::new(), 1, 8))
                .unwrap(),
        };
        let err = Hydrator {
            model: &job,
            direction: Direction::Upload,
            params: &params,
            settings: &settings,
            status: &status,
        }
        .hydrate(&part, &[bad])
        .unwrap_err();
        assert!(matches!(err, PlanError::Corrupt { .. }));
    }
}
