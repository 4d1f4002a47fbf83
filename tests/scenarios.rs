mod common;

use std::{
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

use image::RgbImage;

use common::*;
use gozcu::{
  input::MemoryInput,
  model::Region,
  output::{MemoryOutput, OutputWriter},
  task::{BoundedTask, LiveControls, LiveTask, OneShotTask, Task, TaskError},
  worker::{MediaSession, RunMonitor, RunStatus},
};

#[test]
fn bounded_video_processes_every_other_frame_up_to_limit() {
  let pipeline = car_pipeline(Some("car"));
  let frames = gray_frames(10);
  let mut output = MemoryOutput::default();

  let summary = BoundedTask::new("arabaları göster", 2)
    .unwrap()
    .with_max_frames(Some(3))
    .run_task(MemoryInput::new(frames.clone(), Some(25.0)), &pipeline, &mut output)
    .unwrap();

  assert_eq!(summary.processed_frames, 3);
  assert_eq!(summary.total_frames, 10);
  assert!(!summary.cancelled);
  assert!(summary.is_finalized());
  let indices: Vec<u64> = summary.frames.iter().map(|f| f.frame_index).collect();
  assert_eq!(indices, vec![0, 2, 4]);
  assert!(summary.frames.iter().all(|f| f.objects == vec!["car".to_string()]));

  // 全部输入帧都写出，只有被处理的帧带标注
  assert!(output.is_finished());
  assert_eq!(output.frames().len(), 10);
  for (i, (written, original)) in output.frames().iter().zip(&frames).enumerate() {
    let annotated = matches!(i, 0 | 2 | 4);
    assert_eq!(written != original, annotated, "frame {i}");
  }
}

#[test]
fn processed_count_is_bounded_by_skip_and_limit() {
  for (count, skip, max) in [(10, 1, None), (10, 3, None), (7, 2, Some(2)), (5, 10, Some(4)), (0, 2, Some(1))] {
    let pipeline = car_pipeline(Some("car"));
    let summary = BoundedTask::new("araba", skip)
      .unwrap()
      .with_max_frames(max)
      .run_task(MemoryInput::new(gray_frames(count), None), &pipeline, MemoryOutput::default())
      .unwrap();
    let expected = (count as u64).div_ceil(skip).min(max.unwrap_or(u64::MAX));
    assert_eq!(summary.processed_frames, expected, "N={count} skip={skip} max={max:?}");
    assert_eq!(summary.total_frames, count as u64);
  }
}

#[test]
fn color_query_keeps_only_red_car() {
  let model = FixedModel::new(vec![
    boxed(CAR, [0.0, 0.0, 0.5, 1.0]),
    boxed(CAR, [0.5, 0.0, 1.0, 1.0]),
  ]);
  let pipeline = gozcu::pipeline::FilterPipeline::new(model, StaticClassifier(Some("car"))).unwrap();
  let mut output = MemoryOutput::default();

  let report = OneShotTask::new("kırmızı arabaları göster")
    .run_task(
      MemoryInput::new(vec![red_blue_image()], None),
      &pipeline,
      &mut output,
    )
    .unwrap();

  assert_eq!(report.found, 1);
  assert_eq!(report.objects, vec!["car".to_string()]);
  assert_eq!(report.detections.items[0].region, Region::Box([0.0, 0.0, 0.5, 1.0]));
  assert!(report.saved);
  assert_eq!(output.frames().len(), 1);
}

#[test]
fn classifier_timeout_gives_empty_result() {
  let pipeline = car_pipeline(None);
  let mut output = MemoryOutput::default();

  let report = OneShotTask::new("arabaları göster")
    .run_task(MemoryInput::new(gray_frames(1), None), &pipeline, &mut output)
    .unwrap();

  assert_eq!(report.found, 0);
  assert!(report.detections.is_empty());
  assert!(!report.saved);
  assert!(output.frames().is_empty());
}

#[test]
fn live_detection_toggled_on_mid_stream() {
  let pipeline = car_pipeline(Some("car"));
  let controls = LiveControls::new(false, 2).unwrap();
  let input = ToggleInput::new(gray_frames(10), controls.clone(), 4);
  let mut output = MemoryOutput::default();

  let summary = LiveTask::new("araba", controls)
    .run_task(input, &pipeline, &mut output)
    .unwrap();

  let indices: Vec<u64> = summary.frames.iter().map(|f| f.frame_index).collect();
  assert_eq!(indices, vec![4, 6, 8]);
  assert_eq!(summary.total_frames, 10);
  assert_eq!(output.frames().len(), 10);
  assert!(output.is_finished());
}

#[test]
fn capture_error_stops_run_and_finishes_output() {
  let pipeline = car_pipeline(Some("car"));
  let mut output = MemoryOutput::default();

  let result = BoundedTask::new("araba", 1).unwrap().run_task(
    MemoryInput::new(gray_frames(6), None).with_failure_at(3),
    &pipeline,
    &mut output,
  );

  assert!(matches!(result, Err(TaskError::Capture { frame_index: 3, .. })));
  assert_eq!(output.frames().len(), 3);
  assert!(output.is_finished());

  // 出错前的三帧仍留在摘要里
  let partial = result.as_ref().unwrap_err().partial_summary().unwrap();
  assert_eq!(partial.processed_frames, 3);
  assert_eq!(partial.total_frames, 3);
  assert!(partial.is_finalized());
  assert!(partial.error.as_deref().unwrap().contains("第 3 帧"));
}

#[test]
fn failed_inference_keeps_bounded_run_going() {
  let pipeline = flaky_car_pipeline(vec![2]);
  let frames = gray_frames(10);
  let mut output = MemoryOutput::default();

  let summary = BoundedTask::new("araba", 2)
    .unwrap()
    .with_max_frames(Some(3))
    .run_task(MemoryInput::new(frames.clone(), None), &pipeline, &mut output)
    .unwrap();

  // 第 2 帧推理失败，不计入处理数
  let indices: Vec<u64> = summary.frames.iter().map(|f| f.frame_index).collect();
  assert_eq!(indices, vec![0, 4, 6]);
  assert_eq!(summary.processed_frames, 3);
  assert_eq!(summary.total_frames, 10);
  assert_eq!(output.frames().len(), 10);
  assert_eq!(output.frames()[2], frames[2]);
  assert_ne!(output.frames()[4], frames[4]);
}

#[test]
fn failed_inference_keeps_live_run_going() {
  let pipeline = flaky_car_pipeline(vec![2]);
  let controls = LiveControls::new(true, 2).unwrap();
  let frames = gray_frames(10);
  let mut output = MemoryOutput::default();

  let summary = LiveTask::new("araba", controls)
    .run_task(MemoryInput::new(frames.clone(), None), &pipeline, &mut output)
    .unwrap();

  let indices: Vec<u64> = summary.frames.iter().map(|f| f.frame_index).collect();
  assert_eq!(indices, vec![0, 4, 6, 8]);
  assert_eq!(summary.processed_frames, 4);
  assert_eq!(summary.total_frames, 10);
  assert_eq!(output.frames().len(), 10);
  assert_eq!(output.frames()[2], frames[2]);
}

#[test]
fn live_run_follows_source_frame_rate() {
  let pipeline = gozcu::pipeline::FilterPipeline::new(FixedModel::new(Vec::new()), StaticClassifier(Some("car"))).unwrap();
  let controls = LiveControls::new(true, 1).unwrap();

  let started = Instant::now();
  let summary = LiveTask::new("araba", controls)
    .run_task(MemoryInput::new(gray_frames(6), Some(50.0)), &pipeline, MemoryOutput::default())
    .unwrap();

  assert_eq!(summary.total_frames, 6);
  // 每帧至少 20ms
  assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn live_run_without_pacing_is_not_throttled() {
  let pipeline = gozcu::pipeline::FilterPipeline::new(FixedModel::new(Vec::new()), StaticClassifier(Some("car"))).unwrap();
  let controls = LiveControls::new(true, 1).unwrap();

  let started = Instant::now();
  let summary = LiveTask::new("araba", controls)
    .with_pacing(false)
    .run_task(MemoryInput::new(gray_frames(6), Some(5.0)), &pipeline, MemoryOutput::default())
    .unwrap();

  assert_eq!(summary.total_frames, 6);
  assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn write_failure_reports_output_path() {
  let pipeline = car_pipeline(Some("car"));
  let mut output = MemoryOutput::default();
  output.finish().unwrap();

  let result = BoundedTask::new("araba", 1).unwrap().run_task(
    MemoryInput::new(gray_frames(2), None),
    &pipeline,
    &mut output,
  );
  match result {
    Err(TaskError::Output { path, .. }) => assert_eq!(path, "memory"),
    other => panic!("unexpected result: {other:?}"),
  }
}

#[test]
fn one_shot_without_frames_is_an_error() {
  let pipeline = car_pipeline(Some("car"));
  let result = OneShotTask::new("araba").run_task(
    MemoryInput::new(Vec::<RgbImage>::new(), None),
    &pipeline,
    MemoryOutput::default(),
  );
  assert!(matches!(result, Err(TaskError::NoFrame)));
}

#[test]
fn session_runs_video_in_worker_and_publishes_status() {
  let pipeline = Arc::new(Mutex::new(car_pipeline(Some("car"))));
  let monitor = RunMonitor::new();
  let mut session = MediaSession::new();

  BoundedTask::new("araba", 2)
    .unwrap()
    .with_monitor(monitor.clone())
    .spawn(
      &mut session,
      pipeline.clone(),
      MemoryInput::new(gray_frames(5), None),
      MemoryOutput::default(),
    )
    .unwrap();

  let summary = session.wait().unwrap().unwrap();
  assert_eq!(summary.processed_frames, 3);
  assert_eq!(
    monitor.status.take(),
    Some(RunStatus::Finished {
      processed: 3,
      total: 5,
      cancelled: false,
    })
  );
  let snapshot = monitor.frames.take().unwrap();
  assert_eq!(snapshot.frame_index, 4);
  assert_eq!(snapshot.objects, vec!["car".to_string()]);
  // 运行结束后锁已释放
  assert!(pipeline.try_lock().is_ok());
}

#[test]
fn stopping_live_session_cancels_run() {
  let pipeline = Arc::new(Mutex::new(car_pipeline(Some("car"))));
  let controls = LiveControls::new(true, 1).unwrap();
  let monitor = RunMonitor::new();
  let mut session = MediaSession::new();

  LiveTask::new("araba", controls.clone())
    .with_monitor(monitor.clone())
    .spawn(
      &mut session,
      pipeline.clone(),
      EndlessCamera::new(red_blue_image()),
      MemoryOutput::default(),
    )
    .unwrap();

  // 等到至少一帧被发布
  assert!(
    monitor
      .frames
      .wait_take(Duration::from_secs(5))
      .is_some()
  );

  // 重启会先停止并回收上一次运行
  let previous = LiveTask::new("araba", controls)
    .spawn(
      &mut session,
      pipeline,
      EndlessCamera::new(red_blue_image()),
      MemoryOutput::default(),
    )
    .unwrap()
    .unwrap()
    .unwrap();
  assert!(previous.cancelled);
  assert!(previous.total_frames >= 1);

  let last = session.stop().unwrap().unwrap();
  assert!(last.cancelled);
  assert!(!session.is_running());
}
