use anyhow::{ensure, Result};
use ndarray::Array2;
use noisy_float::prelude::*;
use rpn_eval::{
    identity::IdentityTransport,
    loader::{Batch, LoaderOptions},
    model::{DataDesc, Device, Model, ModelLoader, ModelOutput},
    pipeline::{OutputRecord, PipelineOptions},
    postprocess::{DetectionResult, PostProcessor},
    record::{MultiScale, Record},
    transform::{MetaOnly, Resize, ScaleSpec},
    Error, Evaluation, Evaluator,
};
use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

type Table = HashMap<u64, Vec<([f32; 4], f32)>>;

/// Emits fixed detections per image, scaled into network input space.
#[derive(Debug, Clone, Default)]
struct TableModel {
    table: Arc<Table>,
    fail_im_id: Option<u64>,
    panic_im_id: Option<u64>,
    delay: Option<Duration>,
    forwarded: Arc<AtomicUsize>,
}

impl ModelLoader for TableModel {
    fn load(&self, _device: Device, provide_data: &[DataDesc]) -> Result<Box<dyn Model>> {
        ensure!(
            provide_data.iter().any(|desc| desc.name == "rec_id"),
            "rec_id is not provided"
        );
        Ok(Box::new(self.clone()))
    }
}

impl Model for TableModel {
    fn forward(&mut self, batch: &Batch) -> Result<ModelOutput> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let im_ids = batch.im_id.decode("im_id")?;
        self.forwarded.fetch_add(im_ids.len(), Ordering::SeqCst);
        if let Some(fail_im_id) = self.fail_im_id {
            ensure!(
                !im_ids.contains(&fail_im_id),
                "cannot forward im_id {}",
                fail_im_id
            );
        }
        if let Some(panic_im_id) = self.panic_im_id {
            if im_ids.contains(&panic_im_id) {
                panic!("forward crashed on im_id {}", panic_im_id);
            }
        }

        let (boxes, scores) = im_ids
            .iter()
            .enumerate()
            .map(|(index, im_id)| {
                let scale = batch.im_info[[index, 2]];
                let dets = self.table.get(im_id).cloned().unwrap_or_default();
                let boxes =
                    Array2::from_shape_fn((dets.len(), 4), |(row, col)| dets[row].0[col] * scale);
                let scores = Array2::from_shape_fn((dets.len(), 1), |(row, _)| dets[row].1);
                (boxes, scores)
            })
            .unzip();

        Ok(ModelOutput { boxes, scores })
    }
}

fn records(im_ids: &[u64]) -> Vec<Record> {
    im_ids
        .iter()
        .map(|&im_id| Record {
            rec_id: 0,
            im_id,
            image: PathBuf::from(format!("{}.jpg", im_id)),
            height: 100,
            width: 200,
            gt_boxes: vec![],
            flipped: false,
            scale: None,
        })
        .collect()
}

fn evaluator(model: TableModel, devices: Vec<Device>) -> Evaluator {
    let transform = MetaOnly::new(ScaleSpec {
        short: 50,
        long: 100,
    })
    .unwrap();
    Evaluator::new(Arc::new(model), Arc::new(transform), devices)
}

fn options(batch_size: usize) -> LoaderOptions {
    LoaderOptions {
        batch_size: NonZeroUsize::new(batch_size).unwrap(),
        num_workers: NonZeroUsize::new(2),
        ..Default::default()
    }
}

fn summary(results: &[DetectionResult]) -> Vec<(u64, f32)> {
    results
        .iter()
        .map(|result| (result.image_id, result.score as f32))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn three_images_in_splits_of_two() -> Result<()> {
    let table: Table = vec![
        (1, vec![([10.0, 20.0, 29.0, 39.0], 0.9), ([0.0, 0.0, 9.0, 9.0], 0.4)]),
        (3, vec![([5.0, 5.0, 14.0, 24.0], 0.7)]),
    ]
    .into_iter()
    .collect();
    let model = TableModel {
        table: Arc::new(table),
        ..Default::default()
    };
    let forwarded = model.forwarded.clone();

    let Evaluation { results, .. } = evaluator(model, vec![Device::Cpu, Device::Cuda(0)])
        .with_split_size(NonZeroUsize::new(2).unwrap())
        .with_loader_options(options(1))
        .run(records(&[1, 2, 3]))
        .await?;

    assert_eq!(forwarded.load(Ordering::SeqCst), 3);
    assert_eq!(
        summary(results.as_slice()),
        vec![(1, 0.4), (1, 0.9), (3, 0.7)]
    );
    // boxes are mapped back to image space with inclusive extents
    assert_eq!(results.as_slice()[1].bbox, [10.0, 20.0, 20.0, 20.0]);
    assert_eq!(results.as_slice()[2].bbox, [5.0, 5.0, 10.0, 20.0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn every_record_is_drained_exactly_once() -> Result<()> {
    let im_ids: Vec<u64> = (100..107).collect();
    let table: Table = im_ids
        .iter()
        .map(|&im_id| (im_id, vec![([1.0, 1.0, 4.0, 4.0], im_id as f32 / 1000.0)]))
        .collect();
    let model = TableModel {
        table: Arc::new(table),
        ..Default::default()
    };
    let forwarded = model.forwarded.clone();

    let Evaluation { results, .. } = evaluator(model, vec![Device::Cuda(0), Device::Cuda(1)])
        .with_split_size(NonZeroUsize::new(3).unwrap())
        .with_loader_options(LoaderOptions {
            shuffle: true,
            seed: 3,
            ..options(2)
        })
        .with_pipeline_options(PipelineOptions {
            data_queue_size: NonZeroUsize::new(1).unwrap(),
            collect_timeout: Some(Duration::from_secs(10)),
        })
        .run(records(&im_ids))
        .await?;

    assert_eq!(forwarded.load(Ordering::SeqCst), im_ids.len());
    let image_ids: Vec<u64> = results.iter().map(|result| result.image_id).collect();
    // splits are emitted in order and each image appears once
    assert_eq!(image_ids, im_ids);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_failure_aborts_the_run() {
    let model = TableModel {
        fail_im_id: Some(3),
        ..Default::default()
    };

    let result = evaluator(model, vec![Device::Cpu, Device::Cuda(0)])
        .with_loader_options(options(1))
        .run(records(&[1, 2, 3, 4]))
        .await;

    match result {
        Err(Error::Inference { split, rec_ids, .. }) => {
            assert_eq!(split, 0);
            assert_eq!(rec_ids, vec![2]);
        }
        other => panic!("unexpected result {:?}", other.map(|eval| eval.results)),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_panic_becomes_inference_error() {
    let model = TableModel {
        panic_im_id: Some(2),
        ..Default::default()
    };

    let result = evaluator(model, vec![Device::Cuda(0)])
        .with_loader_options(options(1))
        .run(records(&[1, 2]))
        .await;

    match result {
        Err(Error::Inference {
            device,
            split,
            rec_ids,
            ..
        }) => {
            assert_eq!(device, Device::Cuda(0));
            assert_eq!(split, 0);
            assert_eq!(rec_ids, vec![1]);
        }
        other => panic!("unexpected result {:?}", other.map(|eval| eval.results)),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_image_aborts_the_run() {
    let model = TableModel::default();
    let forwarded = model.forwarded.clone();
    let transform = Resize::new(
        ScaleSpec {
            short: 50,
            long: 100,
        },
        [r64(0.0); 3],
        [r64(1.0); 3],
    )
    .unwrap();

    // the images of the records do not exist
    let result = Evaluator::new(Arc::new(model), Arc::new(transform), vec![Device::Cpu])
        .with_split_size(NonZeroUsize::new(1).unwrap())
        .with_loader_options(options(1))
        .run(records(&[4, 5]))
        .await;

    match result {
        Err(Error::Loader {
            split,
            rec_id,
            im_id,
            ..
        }) => {
            assert_eq!((split, rec_id, im_id), (0, 0, 4));
        }
        other => panic!("unexpected result {:?}", other.map(|eval| eval.results)),
    }
    assert_eq!(forwarded.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_worker_times_out() {
    let model = TableModel {
        delay: Some(Duration::from_millis(500)),
        ..Default::default()
    };

    let result = evaluator(model, vec![Device::Cpu])
        .with_loader_options(options(1))
        .with_pipeline_options(PipelineOptions {
            data_queue_size: NonZeroUsize::new(4).unwrap(),
            collect_timeout: Some(Duration::from_millis(50)),
        })
        .run(records(&[1, 2]))
        .await;

    assert!(matches!(
        result,
        Err(Error::QueueTimeout {
            split: 0,
            received: 0,
            expected: 2,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_run_in_registration_order() -> Result<()> {
    let table: Table = vec![
        (1, vec![([0.0, 0.0, 9.0, 9.0], 0.5)]),
        (2, vec![([0.0, 0.0, 9.0, 9.0], 0.6)]),
    ]
    .into_iter()
    .collect();
    let model = TableModel {
        table: Arc::new(table),
        ..Default::default()
    };
    let calls = Arc::new(Mutex::new(vec![]));

    let drop_first_image = {
        let calls = calls.clone();
        move |outputs: Vec<OutputRecord>, _: &[Record]| -> Result<Vec<OutputRecord>> {
            calls.lock().unwrap().push("drop");
            Ok(outputs
                .into_iter()
                .filter(|output| output.im_id != 1)
                .collect())
        }
    };
    let check_dropped = {
        let calls = calls.clone();
        move |outputs: Vec<OutputRecord>, records: &[Record]| -> Result<Vec<OutputRecord>> {
            calls.lock().unwrap().push("check");
            ensure!(
                outputs.iter().all(|output| output.im_id != 1),
                "im_id 1 is not dropped"
            );
            ensure!(
                outputs
                    .iter()
                    .all(|output| records[output.rec_id].im_id == output.im_id),
                "rec_id does not index the split records"
            );
            Ok(outputs)
        }
    };

    let Evaluation { results, .. } = evaluator(model, vec![Device::Cpu])
        .with_split_size(NonZeroUsize::new(1).unwrap())
        .with_loader_options(options(1))
        .with_filter(drop_first_image)
        .with_filter(check_dropped)
        .run(records(&[1, 2]))
        .await?;

    assert_eq!(summary(results.as_slice()), vec![(2, 0.6)]);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["drop", "check", "drop", "check"]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_scale_detections_fan_in_per_image() -> Result<()> {
    let table: Table = vec![
        (7, vec![([10.0, 20.0, 29.0, 39.0], 0.9), ([0.0, 0.0, 9.0, 9.0], 0.4)]),
        (8, vec![([2.0, 2.0, 5.0, 5.0], 0.3)]),
    ]
    .into_iter()
    .collect();
    let model = TableModel {
        table: Arc::new(table),
        ..Default::default()
    };
    let forwarded = model.forwarded.clone();
    let scales = vec![
        ScaleSpec {
            short: 50,
            long: 100,
        },
        ScaleSpec {
            short: 100,
            long: 200,
        },
    ];

    let Evaluation { results, .. } = evaluator(model, vec![Device::Cpu, Device::Cuda(0)])
        .with_split_size(NonZeroUsize::new(1).unwrap())
        .with_loader_options(options(2))
        .with_record_processor(MultiScale::new(scales)?)
        .run(records(&[7, 8]))
        .await?;

    assert_eq!(forwarded.load(Ordering::SeqCst), 4);
    assert_eq!(
        summary(results.as_slice()),
        vec![(7, 0.4), (7, 0.4), (7, 0.9), (7, 0.9), (8, 0.3), (8, 0.3)]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn top_k_per_image() -> Result<()> {
    let table: Table = vec![(
        1,
        vec![
            ([0.0, 0.0, 9.0, 9.0], 0.1),
            ([1.0, 1.0, 9.0, 9.0], 0.8),
            ([2.0, 2.0, 9.0, 9.0], 0.5),
            ([3.0, 3.0, 9.0, 9.0], 0.3),
        ],
    )]
    .into_iter()
    .collect();
    let model = TableModel {
        table: Arc::new(table),
        ..Default::default()
    };

    let Evaluation { results, .. } = evaluator(model, vec![Device::Cpu])
        .with_postprocessor(PostProcessor::new(NonZeroUsize::new(2).unwrap(), 3))
        .run(records(&[1, 2]))
        .await?;

    assert_eq!(summary(results.as_slice()), vec![(1, 0.5), (1, 0.8)]);
    assert!(results.iter().all(|result| result.category_id == 3));
    assert_eq!(results.as_slice()[1].bbox, [1.0, 1.0, 9.0, 9.0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn float32_identity_overflow() -> Result<()> {
    let limit = rpn_eval::identity::F32_EXACT_LIMIT;
    let loader_options = LoaderOptions {
        identity_transport: IdentityTransport::Float32,
        ..options(1)
    };

    // the largest exact value passes
    let table: Table = vec![(limit - 1, vec![([0.0, 0.0, 1.0, 1.0], 0.5)])]
        .into_iter()
        .collect();
    let model = TableModel {
        table: Arc::new(table),
        ..Default::default()
    };
    let Evaluation { results, .. } = evaluator(model, vec![Device::Cpu])
        .with_loader_options(loader_options.clone())
        .run(records(&[limit - 1]))
        .await?;
    assert_eq!(summary(results.as_slice()), vec![(limit - 1, 0.5)]);

    // the limit itself is rejected
    let result = evaluator(TableModel::default(), vec![Device::Cpu])
        .with_loader_options(loader_options)
        .run(records(&[1, limit]))
        .await;
    assert!(matches!(
        result,
        Err(Error::IdentityOverflow { field: "im_id", .. })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_collection_loads_nothing() -> Result<()> {
    let model = TableModel::default();
    let forwarded = model.forwarded.clone();

    let Evaluation { results, .. } = evaluator(model, vec![Device::Cpu]).run(vec![]).await?;

    assert!(results.is_empty());
    assert_eq!(forwarded.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn images_without_detections_emit_nothing() -> Result<()> {
    let Evaluation { results, .. } = evaluator(TableModel::default(), vec![Device::Cpu])
        .with_split_size(NonZeroUsize::new(2).unwrap())
        .with_loader_options(options(3))
        .run(records(&[1, 2, 3, 4, 5]))
        .await?;

    assert!(results.is_empty());
    let image_ids: HashSet<u64> = results.iter().map(|result| result.image_id).collect();
    assert!(image_ids.is_empty());
    Ok(())
}
