//! Preprocessor → estimator composition over raw text.
//!
//! `fit` fits the preprocessor on the training texts and encodes them;
//! every later call (`partial_fit`, `predict`, validation texts) only
//! transforms with the already-fitted preprocessor.

use fitloop_common::{Encodings, FitError, LabeledTexts, Preprocessor, Result};

use crate::estimator::{Estimator, FitParams};

pub struct Pipeline<P: Preprocessor> {
    preprocessor: P,
    estimator: Estimator,
}

impl<P: Preprocessor> Pipeline<P> {
    pub fn new(preprocessor: P, estimator: Estimator) -> Self {
        Self {
            preprocessor,
            estimator,
        }
    }

    pub fn preprocessor(&self) -> &P {
        &self.preprocessor
    }

    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }

    pub fn estimator_mut(&mut self) -> &mut Estimator {
        &mut self.estimator
    }

    pub fn into_parts(self) -> (P, Estimator) {
        (self.preprocessor, self.estimator)
    }

    /// Fit the preprocessor, then the estimator. `validation` texts are
    /// encoded with the freshly fitted preprocessor.
    ///
    /// Labels, vocabulary size and encoded ids are checked before either
    /// stage changes, so a configuration error leaves the pipeline as it was.
    pub fn fit(
        &mut self,
        texts: &[String],
        labels: &[u32],
        validation: Option<&LabeledTexts>,
        params: FitParams,
    ) -> Result<&mut Self>
    where
        P: Clone,
    {
        if texts.len() != labels.len() {
            return Err(FitError::config(format!(
                "{} texts but {} labels",
                texts.len(),
                labels.len()
            )));
        }
        self.estimator.check_targets(labels)?;
        if let Some(v) = validation {
            self.estimator.check_targets(&v.labels)?;
        }

        let mut fitted = self.preprocessor.clone();
        let encodings = fitted.fit_transform(texts)?;
        if let Some(vocab) = self.estimator.vocab_size() {
            if fitted.vocab_size() > vocab {
                return Err(FitError::config(format!(
                    "preprocessor emits {} ids but the module embeds {vocab}",
                    fitted.vocab_size()
                )));
            }
        }
        let params = with_validation(&fitted, params, validation)?;
        self.estimator.check_data(&encodings, labels, &params)?;

        self.preprocessor = fitted;
        self.estimator.fit(&encodings, labels, params)?;
        Ok(self)
    }

    pub fn partial_fit(
        &mut self,
        texts: &[String],
        labels: &[u32],
        validation: Option<&LabeledTexts>,
        params: FitParams,
    ) -> Result<&mut Self> {
        if !self.estimator.is_fitted() {
            return Err(FitError::NotFitted);
        }
        let encodings = self.transform(texts)?;
        let params = with_validation(&self.preprocessor, params, validation)?;
        self.estimator.partial_fit(&encodings, labels, params)?;
        Ok(self)
    }

    pub fn predict(&self, texts: &[String]) -> Result<Vec<u32>> {
        self.estimator.predict(&self.transform(texts)?)
    }

    pub fn predict_proba(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.estimator.predict_proba(&self.transform(texts)?)
    }

    pub fn score(&self, texts: &[String], labels: &[u32]) -> Result<f32> {
        self.estimator.score(&self.transform(texts)?, labels)
    }

    fn transform(&self, texts: &[String]) -> Result<Encodings> {
        if !self.estimator.is_fitted() {
            return Err(FitError::NotFitted);
        }
        self.preprocessor.transform(texts)
    }
}

fn with_validation<P: Preprocessor>(
    preprocessor: &P,
    mut params: FitParams,
    validation: Option<&LabeledTexts>,
) -> Result<FitParams> {
    if let Some(v) = validation {
        let encodings = preprocessor.transform(&v.texts)?;
        params.validation = Some((encodings, v.labels.clone()));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::EstimatorConfig;
    use crate::scheduler::{LinearDecay, Schedule};
    use fitloop_common::{ClassifierConfig, VocabTokenizer};

    const WORDS: [&str; 3] = ["apple", "river", "engine"];

    fn corpus(n: usize) -> (Vec<String>, Vec<u32>) {
        let texts = (0..n)
            .map(|i| format!("sample {} about the {}", i % 7, WORDS[i % 3]))
            .collect();
        let labels = (0..n).map(|i| (i % 3) as u32).collect();
        (texts, labels)
    }

    fn pipeline(max_epochs: usize) -> Pipeline<VocabTokenizer> {
        // vocab: 3 specials + sample, about, the, 0..6, apple, river, engine
        let mut module = ClassifierConfig::new("bag-of-embeddings", 3, 3 + 3 + 7 + 3);
        module.hidden_size = 16;
        module.intermediate_size = 32;
        let config = EstimatorConfig {
            batch_size: 8,
            max_epochs,
            lr: 3e-2,
            ..Default::default()
        };
        Pipeline::new(VocabTokenizer::new(8), Estimator::new(module, config).unwrap())
    }

    #[test]
    fn one_epoch_over_hundred_texts() {
        let (texts, labels) = corpus(100);
        let mut p = pipeline(1);
        p.fit(&texts, &labels, None, FitParams::seeded(0)).unwrap();

        let est = p.estimator();
        assert_eq!(est.global_step(), 13);
        assert_eq!(est.history().len(), 1);
        let rec = &est.history().epochs()[0];
        assert_eq!(rec.batches.len(), 13);
        assert!(rec.train_loss.unwrap().is_finite());
        assert_eq!(LinearDecay::for_run(3, texts.len(), 8).total_steps(), Some(39));
    }

    #[test]
    fn predict_reuses_fitted_vocabulary() {
        let (texts, labels) = corpus(60);
        let mut p = pipeline(15);
        let (valid_texts, valid_labels) = corpus(12);
        let valid = LabeledTexts {
            texts: valid_texts,
            labels: valid_labels,
        };
        p.fit(&texts, &labels, Some(&valid), FitParams::seeded(1)).unwrap();
        assert!(p.estimator().history().last().unwrap().valid_loss.is_some());

        let unseen = vec!["totally new words about the river".to_string()];
        assert_eq!(p.predict(&unseen).unwrap().len(), 1);
        assert!(p.score(&texts, &labels).unwrap() > 0.9);

        p.partial_fit(&texts[..16], &labels[..16], None, FitParams::seeded(1)).unwrap();
        assert_eq!(p.estimator().history().len(), 16);
    }

    #[test]
    fn predict_before_fit_is_not_fitted() {
        let p = pipeline(1);
        let err = p.predict(&["x".to_string()]).unwrap_err();
        assert!(err.is_not_fitted());
    }

    #[test]
    fn bad_labels_leave_the_preprocessor_as_it_was() {
        let (texts, mut labels) = corpus(30);
        labels[4] = 7;
        let mut p = pipeline(1);
        let before = p.preprocessor().vocab_size();
        let err = p.fit(&texts, &labels, None, FitParams::seeded(0)).err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(p.preprocessor().vocab_size(), before);
        assert!(!p.estimator().is_fitted());
    }

    #[test]
    fn vocabulary_larger_than_the_module_is_rejected() {
        let (mut texts, labels) = corpus(30);
        texts[0] = "zebra quartz violin".to_string();
        let mut p = pipeline(1);
        let before = p.preprocessor().vocab_size();
        let err = p.fit(&texts, &labels, None, FitParams::seeded(0)).err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(p.preprocessor().vocab_size(), before);
        assert!(!p.estimator().is_fitted());
    }
}
