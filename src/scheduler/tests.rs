//! Unit tests for the scheduler

#[cfg(test)]
mod tests {
    use super::super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::time::Duration;

    fn counting_task(name: &str, schedule: &str, counter: Arc<AtomicUsize>) -> TaskSpec {
        TaskSpec::new(name, schedule, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn noop(name: &str, schedule: &str) -> TaskSpec {
        TaskSpec::new(name, schedule, || async { Ok(()) })
    }

    #[test]
    fn test_add_task_validation() {
        let scheduler = Scheduler::new();

        let err = scheduler.add_task(noop("", "30m")).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidTask(_)));

        let err = scheduler.add_task(noop("cycle", " ")).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidTask(_)));

        let err = scheduler.add_task(noop("cycle", "every tuesday")).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidScheduleFormat(_)));

        scheduler.add_task(noop("cycle", "30m")).unwrap();
        let err = scheduler.add_task(noop("cycle", "1h")).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidTask(_)));
    }

    #[test]
    fn test_snapshot_before_start() {
        let scheduler = Scheduler::new();
        scheduler.add_task(noop("b", "30m")).unwrap();
        scheduler.add_task(noop("a", "1h").enabled(false)).unwrap();

        let all = scheduler.get_all_tasks();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");
        assert_eq!(all[0].state, TaskState::Disabled);
        assert_eq!(all[1].state, TaskState::Idle);
        assert_eq!(all[1].schedule, "every 30m");
        assert_eq!(all[1].run_count, 0);
        assert!(scheduler.get_task("missing").is_none());
    }

    #[tokio::test]
    async fn test_interval_task_fires_repeatedly() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_task(counting_task("tick", "40", counter.clone())).unwrap();

        scheduler.start().await.unwrap();
        assert_eq!(scheduler.get_task("tick").unwrap().state, TaskState::Scheduled);

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {} times", fired);

        let snapshot = scheduler.get_task("tick").unwrap();
        assert_eq!(snapshot.run_count as usize, fired);
        assert!(snapshot.last_run.is_some());
        assert!(snapshot.next_run.is_none());
        assert_eq!(snapshot.state, TaskState::Idle);

        // No timers after stop
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_run_immediately_completes_before_start_returns() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(counting_task("boot", "1h", counter.clone()).run_immediately(true))
            .unwrap();

        scheduler.start().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let snapshot = scheduler.get_task("boot").unwrap();
        assert_eq!(snapshot.state, TaskState::Scheduled);
        assert!(snapshot.next_run.is_some());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_disabled_task_never_fires() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(counting_task("off", "20", counter.clone()).enabled(false))
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let snapshot = scheduler.get_task("off").unwrap();
        assert_eq!(snapshot.state, TaskState::Disabled);
        assert!(snapshot.next_run.is_none());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_enable_and_disable_while_running() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(counting_task("toggle", "30", counter.clone()).enabled(false))
            .unwrap();
        scheduler.start().await.unwrap();

        scheduler.enable_task("toggle").unwrap();
        assert!(scheduler.get_task("toggle").unwrap().next_run.is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);

        scheduler.disable_task("toggle").unwrap();
        let after_disable = counter.load(Ordering::SeqCst);
        assert_eq!(scheduler.get_task("toggle").unwrap().state, TaskState::Disabled);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_disable);

        assert!(matches!(
            scheduler.enable_task("nope"),
            Err(DaemonError::TaskNotFound(_))
        ));
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_task_added_while_running_is_armed() {
        let scheduler = Scheduler::new();
        scheduler.start().await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_task(counting_task("late", "30", counter.clone())).unwrap();
        let snapshot = scheduler.get_task("late").unwrap();
        assert_eq!(snapshot.state, TaskState::Scheduled);
        assert!(snapshot.next_run.is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_remove_task_cancels_timer() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_task(counting_task("gone", "40", counter.clone())).unwrap();
        scheduler.start().await.unwrap();

        scheduler.remove_task("gone").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(scheduler.get_task("gone").is_none());
        assert!(scheduler.get_all_tasks().is_empty());
        assert!(matches!(
            scheduler.remove_task("gone"),
            Err(DaemonError::TaskNotFound(_))
        ));
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_run_now_returns_result_and_records_errors() {
        let scheduler = Scheduler::new();
        scheduler
            .add_task(TaskSpec::new("flaky", "1h", || async {
                Err(DaemonError::ExternalService("boom".into()))
            }))
            .unwrap();

        for _ in 0..12 {
            let err = scheduler.run_now("flaky").await.unwrap_err();
            assert!(matches!(err, DaemonError::ExternalService(_)));
        }

        let snapshot = scheduler.get_task("flaky").unwrap();
        assert_eq!(snapshot.run_count, 12);
        assert_eq!(snapshot.recent_errors.len(), MAX_TASK_ERRORS);
        assert!(snapshot.recent_errors[0].message.contains("boom"));

        assert!(matches!(
            scheduler.run_now("missing").await,
            Err(DaemonError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_never_overlap() {
        let scheduler = Scheduler::new();
        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, m, r) = (active.clone(), max_seen.clone(), runs.clone());
        scheduler
            .add_task(TaskSpec::new("slow", "5", move || {
                let (a, m, r) = (a.clone(), m.clone(), r.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();

        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reenable_during_run_keeps_single_runner() {
        let scheduler = Scheduler::new();
        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, m, r) = (active.clone(), max_seen.clone(), runs.clone());
        scheduler
            .add_task(TaskSpec::new("busy", "5", move || {
                let (a, m, r) = (a.clone(), m.clone(), r.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();

        scheduler.start().await.unwrap();
        // First run is in flight
        tokio::time::sleep(Duration::from_millis(25)).await;
        scheduler.disable_task("busy").unwrap();
        scheduler.enable_task("busy").unwrap();
        assert_eq!(scheduler.get_task("busy").unwrap().state, TaskState::Running);

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        // Re-armed once the in-flight run settled
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_action_finish() {
        let scheduler = Scheduler::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        scheduler
            .add_task(TaskSpec::new("long", "10", move || {
                let f = f.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();

        scheduler.start().await.unwrap();
        // Let the first fire begin, then stop mid-action
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.get_task("long").unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_cron_task_is_scheduled() {
        let scheduler = Scheduler::new();
        scheduler.add_task(noop("minutely", "* * * * *")).unwrap();
        scheduler.start().await.unwrap();

        let snapshot = scheduler.get_task("minutely").unwrap();
        assert_eq!(snapshot.state, TaskState::Scheduled);
        let next = snapshot.next_run.unwrap();
        let wait = next - Utc::now();
        assert!(wait <= chrono::Duration::seconds(61));
        assert!(wait > chrono::Duration::zero());
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_invalid_cron_is_recorded_not_fired() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        // Looks like cron, fails only at evaluation
        scheduler.add_task(counting_task("bad", "* * 99 * *", counter.clone())).unwrap();
        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = scheduler.get_task("bad").unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(snapshot.recent_errors.len(), 1);
        assert!(snapshot.next_run.is_none());
        scheduler.stop();
    }
}
