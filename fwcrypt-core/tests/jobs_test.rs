// Job pool and report store behavior
mod fixtures;

#[cfg(test)]
mod tests {
    use super::fixtures;
    use fwcrypt_core::engine::compliance::{Ruleset, RulesetStore};
    use fwcrypt_core::engine::jobs::{JobManager, JobOptions, JobStatus, ReportListener, Submission};
    use fwcrypt_core::engine::pipeline::Pipeline;
    use fwcrypt_core::engine::store::ReportStore;
    use fwcrypt_core::AnalysisReport;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager(store: ReportStore) -> Arc<JobManager> {
        Arc::new(JobManager::new(
            JobOptions {
                workers: 2,
                queue_capacity: 8,
                timeout: Duration::from_secs(60),
            },
            Arc::new(Pipeline::default()),
            Arc::new(RulesetStore::new(Ruleset::embedded().unwrap())),
            Arc::new(store),
        ))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ReportListener for Recorder {
        fn report_ready(&self, report: &Arc<AnalysisReport>) {
            self.0.lock().push(report.content_hash.clone());
        }
    }

    #[tokio::test]
    async fn test_identical_bytes_are_analyzed_once() {
        let jobs = manager(ReportStore::in_memory());
        let first = jobs.submit(fixtures::aes_image(), Some("aes.bin".to_string())).unwrap();
        let report = first.report().await.unwrap();
        assert_eq!(first.job().unwrap().status(), JobStatus::Completed {
            content_hash: report.content_hash.clone()
        });

        let second = jobs.submit(fixtures::aes_image(), Some("copy.bin".to_string())).unwrap();
        match second {
            Submission::Cached(cached) => assert!(Arc::ptr_eq(&cached, &report)),
            other => panic!("expected cached report, got {:?}", other),
        }
        assert_eq!(jobs.store().len(), 1);
    }

    #[tokio::test]
    async fn test_resubmitted_bytes_are_found_by_new_name() {
        let jobs = manager(ReportStore::in_memory());
        let first = jobs.submit(fixtures::aes_image(), Some("aes.bin".to_string())).unwrap();
        let attached = jobs.submit(fixtures::aes_image(), Some("aes_copy.bin".to_string())).unwrap();
        assert!(matches!(attached, Submission::Attached(_)));
        let report = first.report().await.unwrap();
        attached.report().await.unwrap();

        let cached = jobs.submit(fixtures::aes_image(), Some("router_v2.bin".to_string())).unwrap();
        assert!(matches!(cached, Submission::Cached(_)));

        let store = jobs.store();
        for name in ["aes.bin", "aes_copy.bin", "router_v2.bin"] {
            let found = store.lookup(name).unwrap();
            assert!(Arc::ptr_eq(&found, &report), "{} not indexed", name);
        }
        assert_eq!(report.file_name.as_deref(), Some("aes.bin"));
        assert_eq!(store.len(), 1);
        assert!(!store.alias("other.bin", "0000"));
    }

    #[tokio::test]
    async fn test_listener_sees_completed_reports() {
        let recorder = Arc::new(Recorder::default());
        let jobs = Arc::new(
            JobManager::new(
                JobOptions {
                    workers: 1,
                    queue_capacity: 8,
                    timeout: Duration::from_secs(60),
                },
                Arc::new(Pipeline::default()),
                Arc::new(RulesetStore::new(Ruleset::embedded().unwrap())),
                Arc::new(ReportStore::in_memory()),
            )
            .with_listener(recorder.clone()),
        );
        let report = jobs.submit(fixtures::md5_image(), None).unwrap().report().await.unwrap();
        // failed jobs are not announced
        let _ = jobs.submit(Arc::from(vec![0u8; 64]), None).unwrap().report().await;
        assert_eq!(*recorder.0.lock(), vec![report.content_hash.clone()]);
    }

    #[tokio::test]
    async fn test_reports_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let hash = {
            let jobs = manager(ReportStore::open(dir.path()).unwrap());
            let submission = jobs.submit(fixtures::aes_image(), Some("aes.bin".to_string())).unwrap();
            submission.report().await.unwrap().content_hash.clone()
        };

        let reopened = ReportStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        let by_hash = reopened.get(&hash).unwrap();
        let by_name = reopened.lookup("aes.bin").unwrap();
        assert!(Arc::ptr_eq(&by_hash, &by_name));
        assert_eq!(by_hash.detections.len(), 1);

        // the restarted pool serves the stored report
        let jobs = manager(reopened);
        assert!(matches!(
            jobs.submit(fixtures::aes_image(), None).unwrap(),
            Submission::Cached(_)
        ));
    }

    #[test]
    fn test_corrupt_report_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deadbeef.json.zst"), b"not zstd").unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
    }
}
