//! Batched region proposal evaluation.
//!
//! Records are evaluated split by split. Each split is fed through a pool of
//! inference workers, collected back per record, filtered, merged per image
//! and converted into COCO style results, which are finally scored for
//! recall.

mod common;

pub mod aggregate;
pub mod config;
pub mod error;
pub mod filter;
pub mod identity;
pub mod loader;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod record;
pub mod timing;
pub mod transform;

pub use error::{Error, Result};

use crate::{
    aggregate::aggregate,
    common::*,
    config::{Config, FilterConfig, ModelKind, TransformConfig},
    filter::{apply_filters, ClipToImage, MinSize, OutputFilter},
    loader::{BatchLoader, LoaderOptions},
    model::{DataDesc, Device, Model, ModelLoader, PrecomputedLoader},
    pipeline::{Pipeline, PipelineOptions},
    postprocess::{PostProcessor, ResultCollection},
    record::{load_records, MultiScale, Record, RecordProcessor, RecordStream, Split},
    timing::Timing,
    transform::{MetaOnly, Resize, Transform},
};

/// The outcome of an evaluation run.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub results: ResultCollection,
    pub timing: Timing,
}

/// Runs the whole pipeline over a record collection.
pub struct Evaluator {
    model_loader: Arc<dyn ModelLoader>,
    devices: Vec<Device>,
    transform: Arc<dyn Transform>,
    split_size: NonZeroUsize,
    loader_options: LoaderOptions,
    pipeline_options: PipelineOptions,
    record_processors: Vec<Box<dyn RecordProcessor>>,
    filters: Vec<Box<dyn OutputFilter>>,
    postprocessor: PostProcessor,
}

impl Evaluator {
    pub fn new(
        model_loader: Arc<dyn ModelLoader>,
        transform: Arc<dyn Transform>,
        devices: Vec<Device>,
    ) -> Self {
        Self {
            model_loader,
            devices,
            transform,
            split_size: NonZeroUsize::new(1000).unwrap(),
            loader_options: LoaderOptions::default(),
            pipeline_options: PipelineOptions::default(),
            record_processors: vec![],
            filters: vec![],
            postprocessor: PostProcessor::default(),
        }
    }

    /// Build the evaluator and its bundled collaborators from configuration.
    pub fn from_config(config: &Config) -> Fallible<Self> {
        config.validate()?;
        let Config {
            model: model_config,
            loader: loader_config,
            pipeline: pipeline_config,
            postprocess: postprocess_config,
            ..
        } = config;

        let model_loader: Arc<dyn ModelLoader> = match model_config.kind {
            ModelKind::Precomputed => Arc::new(PrecomputedLoader::open(
                &model_config.prefix,
                model_config.epoch,
            )?),
        };

        let scale = loader_config.transform.scale();
        let transform: Arc<dyn Transform> = match loader_config.transform {
            TransformConfig::MetaOnly { .. } => Arc::new(MetaOnly::new(scale)?),
            TransformConfig::Resize { mean, std, .. } => Arc::new(Resize::new(scale, mean, std)?),
        };

        let mut evaluator = Self::new(model_loader, transform, model_config.devices.clone())
            .with_split_size(pipeline_config.split_size)
            .with_loader_options(loader_config.options())
            .with_pipeline_options(pipeline_config.options()?)
            .with_postprocessor(PostProcessor::new(
                postprocess_config.max_dets,
                postprocess_config.category_id,
            ));

        if !loader_config.test_scales.is_empty() {
            evaluator = evaluator
                .with_record_processor(MultiScale::new(loader_config.test_scales.clone())?);
        }

        for filter in &postprocess_config.filters {
            evaluator = match *filter {
                FilterConfig::ClipToImage => evaluator.with_filter(ClipToImage),
                FilterConfig::MinSize { min_size } => evaluator.with_filter(MinSize::new(min_size)?),
            };
        }

        Ok(evaluator)
    }

    pub fn with_split_size(mut self, split_size: NonZeroUsize) -> Self {
        self.split_size = split_size;
        self
    }

    pub fn with_loader_options(mut self, options: LoaderOptions) -> Self {
        self.loader_options = options;
        self
    }

    pub fn with_pipeline_options(mut self, options: PipelineOptions) -> Self {
        self.pipeline_options = options;
        self
    }

    pub fn with_postprocessor(mut self, postprocessor: PostProcessor) -> Self {
        self.postprocessor = postprocessor;
        self
    }

    pub fn with_record_processor<P>(mut self, processor: P) -> Self
    where
        P: RecordProcessor + 'static,
    {
        self.record_processors.push(Box::new(processor));
        self
    }

    /// Append an output filter. Filters run in the order they are added.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: OutputFilter + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    /// Evaluate all records.
    ///
    /// Models are loaded once the input fields of the first split are known.
    /// Nothing is returned unless every split succeeds.
    pub async fn run(&self, records: Vec<Record>) -> Result<Evaluation> {
        let stream = RecordStream::new(records, self.split_size);
        info!(
            "evaluate {} records in {} splits",
            stream.num_records(),
            stream.num_splits()
        );

        let mut results = ResultCollection::new();
        let mut timing = Timing::new();
        let mut splits = stream.splits(&self.record_processors);

        let first_loader = match splits.next() {
            Some(split) => self.batch_loader(split?),
            None => return Ok(Evaluation { results, timing }),
        };

        let models = self.load_models(first_loader.provide_data()).await?;
        timing.set_record("load models");
        let pipeline = Pipeline::new(models, self.pipeline_options.clone())?;

        let outcome = async {
            self.evaluate_split(&pipeline, first_loader, &mut results, &mut timing)
                .await?;
            for split in splits {
                let loader = self.batch_loader(split?);
                self.evaluate_split(&pipeline, loader, &mut results, &mut timing)
                    .await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                pipeline.shutdown().await;
                info!("collected {} detections", results.len());
                Ok(Evaluation { results, timing })
            }
            Err(err) => {
                // workers leave once the data queue is dropped
                drop(pipeline);
                Err(err)
            }
        }
    }

    fn batch_loader(&self, split: Split) -> BatchLoader {
        let Split {
            index,
            range,
            records,
        } = split;
        info!(
            "split {} covers records {}..{}, {} after preparation",
            index,
            range.start,
            range.end,
            records.len()
        );
        BatchLoader::new(
            index,
            records,
            self.transform.clone(),
            self.loader_options.clone(),
        )
    }

    async fn load_models(
        &self,
        provide_data: Vec<DataDesc>,
    ) -> Result<Vec<(Device, Box<dyn Model>)>> {
        let provide_data = Arc::new(provide_data);
        let model_loader = self.model_loader.clone();

        stream::iter(self.devices.clone())
            .par_map(None, move |device| {
                let model_loader = model_loader.clone();
                let provide_data = provide_data.clone();

                move || -> Result<_> {
                    let model = model_loader
                        .load(device, &provide_data)
                        .map_err(|err| Error::ModelLoad {
                            device,
                            source: err.into(),
                        })?;
                    Ok((device, model))
                }
            })
            .try_collect()
            .await
    }

    async fn evaluate_split(
        &self,
        pipeline: &Pipeline,
        loader: BatchLoader,
        results: &mut ResultCollection,
        timing: &mut Timing,
    ) -> Result<()> {
        let split = loader.split();

        async move {
            let instant = Instant::now();
            let outputs = pipeline.run_split(&loader).await?;
            timing.add_record("network", instant.elapsed());

            let instant = Instant::now();
            let outputs = apply_filters(split, &self.filters, outputs, loader.records())?;
            let entries = aggregate(outputs)?;
            timing.add_record("aggregate", instant.elapsed());

            let instant = Instant::now();
            let num_images = entries.len();
            let num_before = results.len();
            self.postprocessor.process(entries, results)?;
            timing.add_record("convert", instant.elapsed());

            info!(
                "split {} produced {} detections over {} images",
                split,
                results.len() - num_before,
                num_images
            );
            Ok(())
        }
        .instrument(info_span!("split", index = split))
        .await
    }
}

/// Score the results against the COCO ground truth in `annotation_file`.
pub fn score(
    annotation_file: &Path,
    results: &ResultCollection,
    max_dets: Vec<usize>,
) -> Fallible<Vec<coco_recall::Summary>> {
    let gt = coco_recall::GroundTruth::load(annotation_file)?;
    let params = coco_recall::Params::with_max_dets(max_dets)?;
    let mut eval = coco_recall::RecallEval::new(&gt, results.to_detections(), params)?;
    eval.evaluate()?;
    eval.accumulate()?;
    eval.summarize()
}

/// Evaluate the configured dataset, save the results and score them.
pub async fn start(config: Arc<Config>, skip_eval: bool) -> Fallible<()> {
    let records = {
        let dataset = &config.dataset;
        load_records(&dataset.cache_root, &dataset.image_sets, &dataset.cache_ext)?
    };

    let evaluator = Evaluator::from_config(&config)?;
    let Evaluation {
        results,
        mut timing,
    } = evaluator.run(records).await?;

    let path = output::result_path(
        &config.run.experiments_dir,
        &config.run.name,
        &config.dataset.image_sets[0],
    );
    output::save_results(&path, &results)?;

    if !skip_eval {
        let annotation_file = config.dataset.annotation_file.clone();
        let max_dets = config.scorer.max_dets.clone();
        let instant = Instant::now();
        tokio::task::spawn_blocking(move || score(&annotation_file, &results, max_dets))
            .await??;
        timing.add_record("score", instant.elapsed());
    }

    timing.report();
    Ok(())
}
