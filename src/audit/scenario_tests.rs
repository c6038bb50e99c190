// End-to-end runs of the pipeline on synthetic jobs.

use std::sync::Arc;

use contest_tally::{check_conservation, CONTEST_HEADER};

use crate::audit::bif::{load_bif, BifReport, BIF_DIR};
use crate::audit::compare::{cmpcvr_name, load_cmpcvr, BlankRow, CmpcvrRow, DisagreedRow, BLANKS_PREFIX, CMPCVR_DIR, DISAGREED_PREFIX};
use crate::audit::logs::EXCEPTION_REPORT_NAME;
use crate::audit::marks::{load_marks, marks_name, MARKS_DIR};
use crate::audit::report::{DISCREPANCIES_NAME, REPORT_DIR, TOTALS_NAME};
use crate::audit::settings::{Delegation, Operation};
use crate::audit::stages::{get_status, StageSummary, STAGE_SUMMARY_NAME};
use crate::audit::styles::{failed_styles, has_template, mapped_styles, RoisMapRow, ROISMAP_NAME, STYLES_DIR, MAP_REPORT_NAME};
use crate::audit::tasks::{Stage, CHUNKS_DIR};
use crate::audit::test_fixtures::*;
use crate::audit::tracker::{TaskStatus, Tracker};
use crate::audit::*;

fn mayor_eif() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![("Mayor", "1", "A"), ("Mayor", "", "B")]
}

fn three_ballots(second: &[&str]) -> Vec<FixtureBallot> {
    let layout = [printed("Mayor", &["A", "B"])];
    vec![
        ballot("0001", "1", &layout, &[("Mayor", &["A"])]),
        ballot("0002", "1", &layout, &[("Mayor", second)]),
        ballot("0003", "1", &layout, &[("Mayor", &["A"])]),
    ]
}

fn stage_summary(ctx: &JobContext, stage: Stage) -> StageSummary {
    ctx.db
        .load_json(stage.dirname(), None, STAGE_SUMMARY_NAME)
        .unwrap()
}

#[test]
fn happy_path() {
    let ballots = three_ballots(&["B"]);
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &ballots)
        .with_cvr_of(&ballots);
    let ctx = fx.ctx();
    run_pipeline(&ctx);

    assert_eq!(load_bif(&ctx.db, "archive1").unwrap().len(), 3);
    assert!(has_template(&ctx.db, "1").unwrap());
    let roismap: Vec<RoisMapRow> = ctx.db.load_table(STYLES_DIR, None, ROISMAP_NAME).unwrap();
    assert_eq!(roismap.len(), 3);
    assert_eq!(roismap.iter().filter(|r| r.option == CONTEST_HEADER).count(), 1);
    assert_eq!(load_marks(&ctx.db, "archive1").unwrap().len(), 9);

    let totals = report_totals(&ctx);
    let mayor = &totals["Mayor"];
    assert_eq!((mayor.option_votes("A"), mayor.option_votes("B")), (2, 1));
    assert_eq!((mayor.overvotes, mayor.undervotes, mayor.writeins), (0, 0, 0));
    assert_eq!(mayor.num_ballots, 3);

    let summary = report_summary(&ctx);
    assert_eq!(summary.num_ballots, 3);
    assert_eq!(summary.num_ballots_compared, 3);
    assert_eq!(summary.compare_statuses.get("agreed"), Some(&3));
    assert_eq!(summary.num_discrepancies, 0);
    assert_eq!(summary.invariant_violations, 0);
    assert!(summary.stage_failures.is_empty());
}

#[test]
fn overvoted_contest_gives_no_votes() {
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &three_ballots(&["A", "B"]));
    let ctx = fx.ctx();
    run_pipeline(&ctx);

    let marks = load_marks(&ctx.db, "archive1").unwrap();
    let second: Vec<_> = marks.iter().filter(|r| r.ballot_id == "0002").collect();
    assert_eq!(second.len(), 3);
    assert_eq!(second[0].option, CONTEST_HEADER);
    assert_eq!(second[0].overvotes, 1);
    assert!(second[1..].iter().all(|r| r.num_votes == 0 && r.num_marks == 1));

    let mayor = &report_totals(&ctx)["Mayor"];
    assert_eq!((mayor.option_votes("A"), mayor.option_votes("B")), (2, 0));
    assert_eq!(mayor.overvotes, 1);
    assert_eq!(mayor.tot_votes, 2);
    assert_eq!(report_summary(&ctx).num_overvoted_contests, 1);
}

#[test]
fn undervoted_contest_is_not_a_blank_ballot() {
    let layout = [printed("Mayor", &["A", "B"]), printed("Sheriff", &["C", "D"])];
    let ballots = vec![
        ballot("0001", "1", &layout, &[("Mayor", &["A"]), ("Sheriff", &["C"])]),
        ballot("0002", "1", &layout, &[("Mayor", &["B"]), ("Sheriff", &["D"])]),
        ballot("0003", "1", &layout, &[("Sheriff", &["C"])]),
    ];
    let mut eif = mayor_eif();
    eif.extend([("Sheriff", "1", "C"), ("Sheriff", "", "D")]);
    let fx = JobFixture::new()
        .with_eif(&eif)
        .with_archive("archive1", &ballots)
        .with_cvr_of(&ballots);
    let ctx = fx.ctx();
    run_pipeline(&ctx);

    let marks = load_marks(&ctx.db, "archive1").unwrap();
    let header = marks
        .iter()
        .find(|r| r.ballot_id == "0003" && r.contest == "Mayor" && r.option == CONTEST_HEADER)
        .unwrap();
    assert_eq!((header.undervotes, header.num_marks), (1, 0));

    let mayor = &report_totals(&ctx)["Mayor"];
    assert_eq!((mayor.option_votes("A"), mayor.option_votes("B")), (1, 1));
    assert_eq!(mayor.undervotes, 1);

    let blanks: Vec<BlankRow> = load_cmpcvr(&ctx.db, Some(BLANKS_PREFIX), "archive1").unwrap();
    assert!(blanks.is_empty());
    let summary = report_summary(&ctx);
    assert_eq!(summary.num_blank_ballots, 0);
    assert_eq!(summary.num_ballots_compared, 3);
    // The blank Mayor contest of 0003 is exported as a row with no selection.
    assert_eq!(summary.compare_statuses.get("agreed"), Some(&3));
}

#[test]
fn writein_votes() {
    let layout = [printed("Mayor", &["A", "B", "Write-in"])];
    let ballots = vec![
        ballot("0001", "1", &layout, &[("Mayor", &["A"])]),
        ballot("0002", "1", &layout, &[("Mayor", &["Write-in"])]).with_writein("Mayor", "Zed"),
        ballot("0003", "1", &layout, &[("Mayor", &["B"])]),
    ];
    let mut eif = mayor_eif();
    eif.push(("Mayor", "", "writein:"));
    let fx = JobFixture::new().with_eif(&eif).with_archive("archive1", &ballots);
    let ctx = fx.ctx();
    run_pipeline(&ctx);

    let marks = load_marks(&ctx.db, "archive1").unwrap();
    let w: Vec<_> = marks.iter().filter(|r| r.option == "writein_0").collect();
    assert_eq!(w.len(), 3);
    let voted: Vec<_> = w.iter().filter(|r| r.num_votes == 1).collect();
    assert_eq!(voted.len(), 1);
    assert_eq!(voted[0].ballot_id, "0002");
    assert_eq!(voted[0].writein_name, "Zed");

    let mayor = &report_totals(&ctx)["Mayor"];
    assert_eq!(mayor.writeins, 1);
    assert_eq!(mayor.tot_votes, 3);
}

#[test]
fn failed_task_does_not_stop_the_stage() {
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &three_ballots(&["B"]))
        .set("genmarks_ballots_per_chunk", "1");
    let ctx = fx.ctx_with(Arc::new(FailingAnalyzer::on("0002")));
    for op in [Operation::GenbifFromBallots, Operation::Gentemplates, Operation::Extractvote] {
        run_operation(&ctx, op).unwrap();
    }

    let tracker = Tracker::new(&ctx.db);
    let rec = tracker.load(TaskStatus::Failed, "archive1_chunk_0001").unwrap();
    assert_eq!(rec.error_info.unwrap().error_type, "WorkerFailure");
    let exc = ctx.db.load_text(MARKS_DIR, None, EXCEPTION_REPORT_NAME).unwrap();
    assert!(exc.contains("archive1_chunk_0001"));
    assert!(exc.contains("injected failure on 0002"));

    let s = stage_summary(&ctx, Stage::Marks);
    assert_eq!((s.tasks, s.completed, s.failed), (3, 2, 1));
    let marks = load_marks(&ctx.db, "archive1").unwrap();
    assert!(marks.iter().all(|r| r.ballot_id != "0002"));
    assert_eq!(marks.len(), 6);

    run_operation(&ctx, Operation::CmpcvrAndReport).unwrap();
    let summary = report_summary(&ctx);
    assert_eq!(summary.stage_failures.get("marks"), Some(&1));
    assert_eq!(summary.num_ballots_extracted, 2);
}

#[test]
fn unmapped_style_is_reported() {
    let mayor = [printed("Mayor", &["A", "B"])];
    let dogs = [printed("Dog Catcher", &["Rex", "Fido"])];
    let ballots = vec![
        ballot("0001", "1", &mayor, &[("Mayor", &["A"])]),
        ballot("0002", "1", &mayor, &[("Mayor", &["B"])]),
        ballot("0003", "9", &dogs, &[("Dog Catcher", &["Rex"])]),
        ballot("0004", "9", &dogs, &[("Dog Catcher", &["Fido"])]),
        ballot("0005", "9", &dogs, &[]),
    ];
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &ballots);
    let ctx = fx.ctx();
    run_pipeline(&ctx);

    assert!(failed_styles(&ctx.db).unwrap().contains("9"));
    assert!(!mapped_styles(&ctx.db).unwrap().contains("9"));
    let roismap: Vec<RoisMapRow> = ctx.db.load_table(STYLES_DIR, None, ROISMAP_NAME).unwrap();
    assert!(roismap.iter().all(|r| r.style_num == "1"));
    let marks = load_marks(&ctx.db, "archive1").unwrap();
    assert!(marks.iter().all(|r| r.style_num == "1"));
    let map_report = ctx.db.load_text(STYLES_DIR, None, MAP_REPORT_NAME).unwrap();
    assert!(map_report.contains("FAILED"));

    // The mapping failure does not fail the task.
    let styles = stage_summary(&ctx, Stage::Styles);
    assert_eq!((styles.tasks, styles.completed, styles.failed), (2, 2, 0));

    let summary = report_summary(&ctx);
    assert_eq!(summary.unmapped_ballots.get("9"), Some(&3));
    assert_eq!(summary.num_unmapped_ballots, 3);
    assert_eq!(summary.num_ballots, 5);
    assert_eq!(summary.num_ballots_extracted, 2);
}

#[test]
fn reruns_give_identical_artifacts() {
    let ballots = three_ballots(&["B"]);
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &ballots)
        .with_cvr_of(&ballots)
        .set("genbif_ballots_per_chunk", "2")
        .set("genmarks_ballots_per_chunk", "2");
    let ctx = fx.ctx();
    let artifacts = [
        (BIF_DIR, "archive1_bif.csv".to_string()),
        (MARKS_DIR, marks_name("archive1")),
        (CMPCVR_DIR, cmpcvr_name(None, "archive1")),
        (REPORT_DIR, TOTALS_NAME.to_string()),
        (REPORT_DIR, DISCREPANCIES_NAME.to_string()),
    ];
    let read_all = |ctx: &JobContext| -> Vec<Vec<u8>> {
        artifacts
            .iter()
            .map(|(dir, name)| ctx.db.load_bytes(dir, None, name).unwrap())
            .collect()
    };
    run_pipeline(&ctx);
    let first = read_all(&ctx);

    // Same job, tasks on threads this time.
    let mut settings = ctx.settings.clone();
    settings.delegation = Delegation::Threads;
    let threaded = ctx.with_settings(settings);
    run_pipeline(&threaded);
    assert_eq!(read_all(&threaded), first);
}

#[test]
fn one_result_and_one_terminal_record_per_task() {
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &three_ballots(&["B"]))
        .set("genmarks_ballots_per_chunk", "1");
    let ctx = fx.ctx();
    for op in [Operation::GenbifFromBallots, Operation::Gentemplates, Operation::Extractvote] {
        run_operation(&ctx, op).unwrap();
    }
    let counts = Tracker::new(&ctx.db).counts().unwrap();
    assert_eq!((counts.running, counts.completed, counts.failed), (3, 3, 0));
    let results = ctx.db.list(MARKS_DIR, Some(CHUNKS_DIR), "*.csv").unwrap();
    assert_eq!(
        results,
        vec![
            "archive1_marks_chunk_0000.csv",
            "archive1_marks_chunk_0001.csv",
            "archive1_marks_chunk_0002.csv"
        ]
    );

    // An incremental run finds every result in place.
    let mut settings = ctx.settings.clone();
    settings.incremental = true;
    let again = ctx.with_settings(settings);
    run_operation(&again, Operation::Extractvote).unwrap();
    let s = stage_summary(&again, Stage::Marks);
    assert_eq!((s.tasks, s.skipped, s.completed), (3, 3, 0));
    assert_eq!(load_marks(&again.db, "archive1").unwrap().len(), 9);
}

#[test]
fn every_compared_ballot_has_a_status() {
    let ballots = three_ballots(&["B"]);
    let layout = [printed("Mayor", &["A", "B"])];
    let mut all = ballots.clone();
    all.push(ballot("0004", "1", &layout, &[("Mayor", &["B"])]));
    // The export disagrees on 0002 and does not know 0004.
    let exported = three_ballots(&["A"]);
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &all)
        .with_cvr_of(&exported);
    let ctx = fx.ctx();
    run_pipeline(&ctx);

    let rows: Vec<CmpcvrRow> = load_cmpcvr(&ctx.db, None, "archive1").unwrap();
    assert_eq!(rows.len(), 4);
    let status = |id: &str| {
        rows.iter()
            .find(|r| r.ballot_id == id)
            .map(|r| r.status.to_string())
            .unwrap()
    };
    assert_eq!(status("0001"), "agreed");
    assert_eq!(status("0002"), "disagreed");
    assert_eq!(status("0004"), "missing_cvr");

    let disagreed: Vec<DisagreedRow> = load_cmpcvr(&ctx.db, Some(DISAGREED_PREFIX), "archive1").unwrap();
    for r in rows.iter().filter(|r| r.status.to_string() != "agreed") {
        assert!(disagreed.iter().any(|d| d.ballot_id == r.ballot_id));
    }
    let d = disagreed.iter().find(|d| d.ballot_id == "0002").unwrap();
    assert_eq!((d.audit_votes.as_str(), d.cvr_votes.as_str()), ("A:0;B:1", "A:1;B:0"));
    assert_eq!(report_summary(&ctx).num_discrepancies, disagreed.len());
}

#[test]
fn totals_conserve_votes() {
    let layout = [printed("Council", &["C", "D", "E"])];
    let ballots = vec![
        ballot("0001", "2", &layout, &[("Council", &["C", "D"])]),
        ballot("0002", "2", &layout, &[("Council", &["C", "D", "E"])]),
        ballot("0003", "2", &layout, &[("Council", &["E"])]),
        ballot("0004", "2", &layout, &[]),
    ];
    let fx = JobFixture::new()
        .with_eif(&[("Council", "2", "C"), ("Council", "", "D"), ("Council", "", "E")])
        .with_archive("archive1", &ballots);
    let ctx = fx.ctx();
    run_pipeline(&ctx);

    let council = &report_totals(&ctx)["Council"];
    assert!(check_conservation("Council", council, 2).is_ok());
    assert_eq!(council.tot_votes, 3);
    assert_eq!((council.overvotes, council.undervotes), (1, 3));
    let summary = report_summary(&ctx);
    assert_eq!(summary.invariant_violations, 0);
    assert_eq!(summary.num_blank_ballots, 1);
}

#[test]
fn bif_from_cvr_and_separate_mapping() {
    let ballots = three_ballots(&["B"]);
    let layout = [printed("Mayor", &["A", "B"])];
    let mut exported = ballots.clone();
    exported.push(ballot("0009", "1", &layout, &[("Mayor", &["A"])]));
    let fx = JobFixture::new()
        .with_eif(&mayor_eif())
        .with_archive("archive1", &ballots)
        .with_cvr_of(&exported)
        .set("include_maprois", "false");
    let ctx = fx.ctx();
    run_operation(&ctx, Operation::GenbifFromCvr).unwrap();

    let bif = load_bif(&ctx.db, "archive1").unwrap();
    assert_eq!(bif.len(), 3);
    assert!(bif.iter().all(|r| r.cvr_file == "cvr_chunk_0000.csv" && r.style_num == "1"));
    let report: BifReport = ctx.db.load_json(BIF_DIR, None, "bif_report.json").unwrap();
    assert_eq!(report.cvr_ballots_without_images, 1);

    run_operation(&ctx, Operation::Gentemplates).unwrap();
    assert!(has_template(&ctx.db, "1").unwrap());
    assert!(mapped_styles(&ctx.db).unwrap().is_empty());
    run_operation(&ctx, Operation::Genmaprois).unwrap();
    assert!(mapped_styles(&ctx.db).unwrap().contains("1"));

    let status = get_status(&ctx).unwrap();
    assert!(status.has_contests && status.has_cvr);
    let styles = status.stages.iter().find(|s| s.stage == Stage::Styles).unwrap();
    assert_eq!(styles.last_run.as_ref().map(|r| r.completed), Some(1));
}

#[test]
fn first_run_needs_an_eif() {
    let fx = JobFixture::new().with_archive("archive1", &three_ballots(&["B"]));
    let e = run_operation(&fx.ctx(), Operation::GenbifFromBallots).unwrap_err();
    assert_eq!(e.kind(), "ConfigurationError");
}
