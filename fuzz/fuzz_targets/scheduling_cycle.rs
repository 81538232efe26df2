#![no_main]

use crunch_core::client::Client;
use crunch_core::config::{Config, HostConfig};
use crunch_core::executor::InMemoryExecutor;
use crunch_core::model::{ClientState, JobState, NewAppVersion, ProjectId};
use crunch_core::rpc::{ReplyJob, SchedulerReply};
use libfuzzer_sys::fuzz_target;

const NCPUS: u32 = 2;

fn reply(seq: u64, count: u8, cpu_raw: u8, deadline: f64) -> SchedulerReply {
    SchedulerReply {
        app_versions: vec![NewAppVersion {
            app_name: "app".to_string(),
            version_num: 1,
            flops: 1.0,
            avg_ncpus: 1.0,
        }],
        jobs: (0..count)
            .map(|i| ReplyJob {
                name: format!("wu_{seq}_{i}"),
                app_name: "app".to_string(),
                version_num: 1,
                report_deadline: deadline,
                fpops_est: (f64::from(cpu_raw) + 1.0) * 60.0,
            })
            .collect(),
        ..SchedulerReply::default()
    }
}

fn pick(client: &Client<InMemoryExecutor>, raw: u8) -> Option<ProjectId> {
    let ids: Vec<ProjectId> = client.state().projects().map(|p| p.id).collect();
    if ids.is_empty() {
        None
    } else {
        Some(ids[usize::from(raw) % ids.len()])
    }
}

fn check_invariants(client: &Client<InMemoryExecutor>) {
    let clamp = client.config().scheduler.max_short_term_debt;
    for p in client.state().projects() {
        assert!(p.short_term_debt.is_finite(), "{}: {}", p.url, p.short_term_debt);
        assert!(p.long_term_debt.is_finite(), "{}: {}", p.url, p.long_term_debt);
        assert!(
            p.short_term_debt.abs() <= clamp + 1e-6,
            "{}: short-term debt {} outside clamp {clamp}",
            p.url,
            p.short_term_debt
        );
    }
    let executing = client.executor().executing();
    assert!(
        executing.len() <= NCPUS as usize,
        "{} tasks executing on {NCPUS} CPUs",
        executing.len()
    );
    for id in executing {
        let job = client.state().job(id);
        assert!(
            job.is_some_and(|j| j.state == JobState::FilesDownloaded),
            "executing task for job {id} that is not runnable"
        );
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() > 16_384 {
        return;
    }

    let config = Config {
        host: HostConfig::with_ncpus(NCPUS),
        ..Config::default()
    };
    let mut client = Client::new(config, ClientState::new(), InMemoryExecutor::new(600.0), 0.0);
    let mut now = 0.0;
    let mut seq = 0u64;

    for chunk in data.chunks(4) {
        let [op, target, a, b] = match chunk {
            [w, x, y, z] => [*w, *x, *y, *z],
            _ => break,
        };

        match op % 7 {
            0 => {
                let url = format!("https://p{}.example/", target % 8);
                let _ = client.attach_project(&url, f64::from(a) * 10.0);
            }
            1 => {
                let Some(p) = pick(&client, target) else {
                    continue;
                };
                seq += 1;
                let deadline = now + f64::from(b) * 600.0;
                if client.handle_scheduler_reply(p, reply(seq, a % 4 + 1, b, deadline)).is_ok() {
                    let downloading: Vec<_> = client
                        .state()
                        .jobs_of(p)
                        .filter(|j| j.state == JobState::FilesDownloading)
                        .map(|j| j.id)
                        .collect();
                    for id in downloading {
                        let _ = client.job_input_ready(id);
                    }
                }
            }
            2 | 3 => {
                let report = client.poll(now);
                for id in report.completed.into_iter().chain(report.failed) {
                    let _ = client.job_upload_complete(id);
                }
                check_invariants(&client);
                let dt = (f64::from(a % 10) + 1.0) * 30.0;
                client.executor_mut().advance(dt);
                now += dt;
            }
            4 => {
                if let Some(p) = pick(&client, target) {
                    let suspended = client.state().project(p).is_some_and(|p| p.suspended_via_gui);
                    let _ = if suspended {
                        client.resume_project(p)
                    } else {
                        client.suspend_project(p)
                    };
                }
            }
            5 => {
                if let Some(p) = pick(&client, target) {
                    let _ = client.reset_project(p);
                }
            }
            _ => {
                if let Some(p) = pick(&client, target) {
                    let _ = client.detach_project(p);
                }
            }
        }
        let _ = client.take_work_requests();
    }

    let _ = client.poll(now);
    check_invariants(&client);
});
