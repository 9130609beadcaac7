mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use streamhound::app::job_store::ProgressStore as _;
use streamhound::app::model::{CANCELLED, EpisodeStatus, JobStatus};
use streamhound::error::ScrapeError;
use streamhound::model::ScrapeOptions;

use common::{RecordingProgressStore, harness, harness_with, naruto_site, test_config};

#[tokio::test]
async fn start_lays_out_chunks() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 5, 2)
        .await
        .unwrap();

    assert_eq!(job.total_chunks, 3);
    assert_eq!(job.status, JobStatus::Pending);
    let entries = h.progress.entries(&job.id).await.unwrap();
    assert_eq!(
        entries
            .iter()
            .map(|e| (e.episode_number, e.chunk_number))
            .collect::<Vec<_>>(),
        vec![(1, 1), (2, 1), (3, 2), (4, 2), (5, 3)]
    );
    assert!(entries.iter().all(|e| e.status == EpisodeStatus::Pending));
}

#[tokio::test]
async fn start_rejects_empty_jobs() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let err = h
        .orchestrator
        .start_large_job("20", "Naruto", 0, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::InvalidInput(_)), "{err:?}");
}

#[tokio::test]
async fn rerunning_a_chunk_only_retries_unfinished_episodes() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());
    let cancel = CancellationToken::new();
    let options = ScrapeOptions::default();

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 3, 2)
        .await
        .unwrap();

    let first = h
        .orchestrator
        .scrape_chunk(&job.id, 1, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(first.report.summary.success_count, 1);
    assert_eq!(first.report.summary.error_count, 1);
    assert_eq!(first.job.completed_count, 1);
    assert_eq!(first.job.failed_count, 1);
    assert_eq!(first.job.current_chunk, 1);
    assert_eq!(first.job.status, JobStatus::InProgress);

    // Episode 2 shows up upstream before the retry.
    site.episode_page("naruto", 2, "naruto-2")
        .clean_stream("naruto-2");
    let retried = h
        .orchestrator
        .scrape_chunk(&job.id, 1, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(
        retried
            .report
            .results
            .iter()
            .map(|r| r.episode_number)
            .collect::<Vec<_>>(),
        vec![2]
    );
    assert_eq!(retried.job.completed_count, 2);
    assert_eq!(retried.job.failed_count, 0);
    // Probe plus render from the first run only.
    assert_eq!(site.hit_count("/naruto-episode-1/"), 2);

    let last = h
        .orchestrator
        .scrape_chunk(&job.id, 2, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(last.job.completed_count, 3);
    assert_eq!(last.job.status, JobStatus::Completed);
    assert_eq!(last.job.current_chunk, 2);

    let entries = h.progress.entries(&job.id).await.unwrap();
    assert!(entries.iter().all(|e| e.status == EpisodeStatus::Success));
    assert!(entries.iter().all(|e| e.scraped_at.is_some()));
}

#[tokio::test]
async fn interrupted_entry_is_picked_up_again() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 1, 1)
        .await
        .unwrap();
    let mut entry = h.progress.entries(&job.id).await.unwrap().remove(0);
    entry.transition(EpisodeStatus::Scraping, None).unwrap();
    h.progress.put_entry(&entry).await.unwrap();

    let chunk = h
        .orchestrator
        .scrape_chunk(&job.id, 1, &ScrapeOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(chunk.report.summary.success_count, 1);
    assert_eq!(chunk.job.status, JobStatus::Completed);
    let entries = h.progress.entries(&job.id).await.unwrap();
    assert_eq!(entries[0].status, EpisodeStatus::Success);
    assert_eq!(entries[0].error_message, None);
}

#[tokio::test]
async fn cancelled_chunk_leaves_entries_resumable() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 2, 2)
        .await
        .unwrap();
    let chunk = h
        .orchestrator
        .scrape_chunk(&job.id, 1, &ScrapeOptions::default(), &cancel)
        .await
        .unwrap();

    assert!(chunk.report.results.is_empty());
    assert_eq!(chunk.job.status, JobStatus::InProgress);
    let entries = h.progress.entries(&job.id).await.unwrap();
    assert!(entries.iter().all(|e| e.status.is_resumable()));
}

#[tokio::test]
async fn rerunning_a_completed_job_never_saves_a_contradictory_status() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RecordingProgressStore::new(dir.path()));
    let h = harness_with(test_config(&site.base_url, dir.path()), store.clone());
    let cancel = CancellationToken::new();
    let options = ScrapeOptions::default();

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 2, 2)
        .await
        .unwrap();
    let first = h
        .orchestrator
        .scrape_chunk(&job.id, 1, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(first.job.status, JobStatus::Completed);

    let again = h
        .orchestrator
        .scrape_chunk(&job.id, 1, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(again.job.status, JobStatus::Completed);
    assert_eq!(again.job.completed_count, 1);
    assert_eq!(again.job.failed_count, 1);

    let saved = store.saved();
    assert_eq!(saved.len(), 4);
    for job in &saved {
        assert!(job.processed() <= job.total_episodes, "{job:?}");
        assert_eq!(
            job.processed() == job.total_episodes,
            job.status == JobStatus::Completed,
            "{job:?}"
        );
    }
    // The re-run starts with episode 2 taken out of the counters.
    assert_eq!(saved[2].status, JobStatus::InProgress);
    assert_eq!((saved[2].completed_count, saved[2].failed_count), (1, 0));
}

#[tokio::test]
async fn episode_cancelled_mid_scrape_is_not_counted() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&site.base_url, dir.path());
    config.retry_delay = Duration::from_secs(30);
    let h = harness_with(config, Arc::new(RecordingProgressStore::new(dir.path())));
    let cancel = CancellationToken::new();

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 2, 2)
        .await
        .unwrap();

    // Episode 2 is missing; cancel while it waits to retry.
    let options = ScrapeOptions::default();
    let (chunk, ()) = tokio::join!(
        h.orchestrator
            .scrape_chunk(&job.id, 1, &options, &cancel),
        async {
            while site.hit_count("/?s=Naruto") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        }
    );
    let chunk = chunk.unwrap();

    assert_eq!(chunk.report.results.len(), 1);
    assert_eq!(chunk.job.status, JobStatus::InProgress);
    assert_eq!(chunk.job.completed_count, 1);
    assert_eq!(chunk.job.failed_count, 0);

    let entries = h.progress.entries(&job.id).await.unwrap();
    assert_eq!(entries[1].status, EpisodeStatus::Failed);
    assert_eq!(entries[1].error_message.as_deref(), Some(CANCELLED));
    assert!(entries[1].status.is_resumable());

    let report = h.orchestrator.progress("20").await.unwrap().unwrap();
    assert_eq!(report.job.processed(), 1);
}

#[tokio::test]
async fn rejected_log_write_skips_the_episode() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RecordingProgressStore::new(dir.path()));
    let h = harness_with(test_config(&site.base_url, dir.path()), store.clone());

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 2, 2)
        .await
        .unwrap();
    store.fail_entries.store(true, Ordering::SeqCst);

    let chunk = h
        .orchestrator
        .scrape_chunk(&job.id, 1, &ScrapeOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(chunk.report.results.is_empty());
    assert_eq!(chunk.job.status, JobStatus::InProgress);
    assert_eq!(chunk.job.processed(), 0);
    assert_eq!(h.browser.opened(), 0);
    assert_eq!(site.hit_count("/naruto-episode-1/"), 0);
    let entries = h.progress.entries(&job.id).await.unwrap();
    assert!(entries.iter().all(|e| e.status == EpisodeStatus::Pending));
}

#[tokio::test]
async fn chunk_outside_job_is_rejected() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());
    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 3, 2)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .scrape_chunk(&job.id, 3, &ScrapeOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::InvalidInput(_)), "{err:?}");
}

#[tokio::test]
async fn progress_follows_the_latest_job() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    assert!(h.orchestrator.progress("20").await.unwrap().is_none());

    let job = h
        .orchestrator
        .start_large_job("20", "Naruto", 4, 2)
        .await
        .unwrap();
    h.orchestrator
        .scrape_chunk(&job.id, 1, &ScrapeOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    let report = h.orchestrator.progress("20").await.unwrap().unwrap();
    assert_eq!(report.job.id, job.id);
    assert_eq!(report.job.processed(), 2);
    assert_eq!(report.progress_percentage, 50.0);
}
