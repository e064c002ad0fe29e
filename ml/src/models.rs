//! Symmetric convolutional autoencoders for greedy layer-wise pretraining.
//!
//! Encoder layers are added one at a time on top of the input. Each call
//! creates the encoder operation right away and queues the construction of the
//! mirrored decoder layer, which can only be built once the whole encoder
//! stack is known: the decoder stream starts at the top (the code input) and
//! runs back down to the image. [`AutoencoderBuilder::finalize`] builds the
//! queued decoder layers from the top down and returns the finished
//! [`ConvolutionalAutoencoder`].
//!
//! Besides the full decoder stream, every layer gets a *pretrainer* output: the
//! layer's own encoder output pushed straight through its decoder weights. It
//! reconstructs the input of that single layer and is what layer-wise
//! pretraining minimizes against.
use crate::{
    execution::Feeds,
    graph::{Graph, GraphError, GraphResult, Initializer, NodeId, Shape},
    TensorData,
};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    FullyConnected,
    Convolution,
    Flatten,
}

/// Weight and bias variables of one side of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    pub weights: NodeId,
    pub biases: NodeId,
}

/// A finished layer. All outputs are graph nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    pub kind: LayerKind,
    /// Encoder stage this layer reads from
    pub input: NodeId,
    pub encoder_output: NodeId,
    /// Reconstruction of `input` from the decoder stream
    pub decoder_output: NodeId,
    /// Reconstruction of `input` from `encoder_output`
    pub pretrainer_output: NodeId,
    /// None for flatten layers
    pub encoder: Option<Parameters>,
    pub decoder: Option<Parameters>,
}

/// Decoder side of a layer, produced during finalization.
struct DecoderStage {
    output: NodeId,
    pretrainer: NodeId,
    parameters: Option<Parameters>,
}

/// Builds the decoder of one layer, given the decoder stream coming from above.
type DecoderBuilder =
    Box<dyn FnOnce(&mut Graph, &mut Initializer, NodeId) -> GraphResult<DecoderStage>>;

struct PendingLayer {
    kind: LayerKind,
    input: NodeId,
    encoder_output: NodeId,
    encoder: Option<Parameters>,
    build_decoder: DecoderBuilder,
}

fn weights_name(side: &str, layer: usize) -> String {
    format!("{}_{}.weights", side, layer)
}

fn biases_name(side: &str, layer: usize) -> String {
    format!("{}_{}.biases", side, layer)
}

/// Creates the weight and bias variables of one side of a layer.
fn parameters(
    graph: &mut Graph,
    initializer: &mut Initializer,
    side: &str,
    layer: usize,
    weight_shape: &[usize],
    bias_shape: &[usize],
) -> GraphResult<Parameters> {
    let weights = graph.variable(
        &weights_name(side, layer),
        initializer.random_normal(weight_shape)?,
    )?;
    let biases = graph.variable(
        &biases_name(side, layer),
        initializer.random_normal(bias_shape)?,
    )?;
    Ok(Parameters { weights, biases })
}

/// Incrementally extends an encoder on `graph` and finally mirrors it into a decoder.
///
/// ```ignore
/// let mut graph = Graph::new();
/// let images = graph.placeholder("images", &[5, 256, 256, 3]);
/// let code = graph.placeholder("code", &[5, 64]);
/// let mut builder = AutoencoderBuilder::new(&mut graph, images, code);
/// builder.add_conv2d(5, 5, 3, 128)?.add_flatten()?.add_fc(64)?;
/// let autoencoder = builder.finalize()?;
/// ```
pub struct AutoencoderBuilder<'g> {
    graph: &'g mut Graph,
    initializer: Initializer,
    to_encode: NodeId,
    to_decode: NodeId,
    last_encoder: NodeId,
    pending: Vec<PendingLayer>,
}

impl<'g> AutoencoderBuilder<'g> {
    pub fn new(
        graph: &'g mut Graph,
        to_encode: NodeId,
        to_decode: NodeId,
    ) -> AutoencoderBuilder<'g> {
        AutoencoderBuilder {
            graph,
            initializer: Initializer::default(),
            to_encode,
            to_decode,
            last_encoder: to_encode,
            pending: Vec::new(),
        }
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> AutoencoderBuilder<'g> {
        self.initializer = initializer;
        self
    }

    fn last_shape(&self) -> GraphResult<Shape> {
        Ok(self.graph.shape(self.last_encoder)?.to_vec())
    }

    fn push(
        &mut self,
        kind: LayerKind,
        encoder_output: NodeId,
        encoder: Option<Parameters>,
        build_decoder: DecoderBuilder,
    ) {
        debug!(
            "Layer {} ({:?}) encodes to {:?}",
            self.pending.len(),
            kind,
            self.graph.shape(encoder_output).unwrap_or_default()
        );
        self.pending.push(PendingLayer {
            kind,
            input: self.last_encoder,
            encoder_output,
            encoder,
            build_decoder,
        });
        self.last_encoder = encoder_output;
    }

    /// Fully connected layer with `hidden_size` units on top of a `[batch, visible]` stage.
    pub fn add_fc(&mut self, hidden_size: usize) -> GraphResult<&mut Self> {
        let layer = self.pending.len();
        let input = self.last_encoder;
        let input_shape = self.last_shape()?;
        if input_shape.len() != 2 {
            return Err(GraphError::RankMismatch {
                op: "add_fc",
                expected: 2,
                actual: input_shape,
            });
        }
        let visible_size = input_shape[1];

        let encoder = parameters(
            self.graph,
            &mut self.initializer,
            "encoder",
            layer,
            &[visible_size, hidden_size],
            &[hidden_size],
        )?;
        let fc = self.graph.matmul(input, encoder.weights)?;
        let biased = self.graph.add_bias(fc, encoder.biases)?;
        let encoded = self.graph.relu(biased)?;

        let build_decoder: DecoderBuilder = Box::new(
            move |graph: &mut Graph,
                  initializer: &mut Initializer,
                  stream: NodeId|
                  -> GraphResult<DecoderStage> {
                let decoder = parameters(
                    graph,
                    initializer,
                    "decoder",
                    layer,
                    &[hidden_size, visible_size],
                    &[visible_size],
                )?;
                let dense = |graph: &mut Graph, from: NodeId| -> GraphResult<NodeId> {
                    let fc = graph.matmul(from, decoder.weights)?;
                    let biased = graph.add_bias(fc, decoder.biases)?;
                    graph.relu(biased)
                };
                Ok(DecoderStage {
                    output: dense(graph, stream)?,
                    pretrainer: dense(graph, encoded)?,
                    parameters: Some(decoder),
                })
            },
        );
        self.push(LayerKind::FullyConnected, encoded, Some(encoder), build_decoder);
        Ok(self)
    }

    /// Convolution with `num_filters` filters of size `filter_height x filter_width`,
    /// stride 1 and `SAME` padding, on top of a `[batch, height, width, filter_depth]` stage.
    pub fn add_conv2d(
        &mut self,
        filter_height: usize,
        filter_width: usize,
        filter_depth: usize,
        num_filters: usize,
    ) -> GraphResult<&mut Self> {
        let layer = self.pending.len();
        let input = self.last_encoder;
        let input_shape = self.last_shape()?;
        let filter_shape = vec![filter_height, filter_width, filter_depth, num_filters];
        if input_shape.len() != 4 {
            return Err(GraphError::RankMismatch {
                op: "add_conv2d",
                expected: 4,
                actual: input_shape,
            });
        }
        if input_shape[3] != filter_depth {
            return Err(GraphError::ShapeMismatch {
                op: "add_conv2d",
                lhs: input_shape,
                rhs: filter_shape,
            });
        }
        crate::graph::expect_kernel(&filter_shape)?;

        let encoder = parameters(
            self.graph,
            &mut self.initializer,
            "encoder",
            layer,
            &filter_shape,
            &[num_filters],
        )?;
        let conv = self.graph.conv2d(input, encoder.weights)?;
        let biased = self.graph.add_bias(conv, encoder.biases)?;
        let encoded = self.graph.relu(biased)?;

        let build_decoder: DecoderBuilder = Box::new(
            move |graph: &mut Graph,
                  initializer: &mut Initializer,
                  stream: NodeId|
                  -> GraphResult<DecoderStage> {
                // one bias per output pixel and channel
                let decoder = parameters(
                    graph,
                    initializer,
                    "decoder",
                    layer,
                    &filter_shape,
                    &input_shape[1..],
                )?;
                let deconv = graph.conv2d_transpose(stream, decoder.weights, &input_shape)?;
                let biased = graph.add_bias(deconv, decoder.biases)?;
                let output = graph.relu(biased)?;

                let shortcut = graph.conv2d_transpose(encoded, decoder.weights, &input_shape)?;
                let pretrainer = graph.add_bias(shortcut, decoder.biases)?;
                Ok(DecoderStage {
                    output,
                    pretrainer,
                    parameters: Some(decoder),
                })
            },
        );
        self.push(LayerKind::Convolution, encoded, Some(encoder), build_decoder);
        Ok(self)
    }

    /// Flattens a `[batch, height, width, depth]` stage into `[batch, height * width * depth]`.
    pub fn add_flatten(&mut self) -> GraphResult<&mut Self> {
        let input = self.last_encoder;
        let input_shape = self.last_shape()?;
        if input_shape.len() != 4 {
            return Err(GraphError::RankMismatch {
                op: "add_flatten",
                expected: 4,
                actual: input_shape,
            });
        }
        let pixel_size: usize = input_shape[1..].iter().product();
        let flat = self.graph.reshape(input, &[input_shape[0], pixel_size])?;

        let build_decoder: DecoderBuilder = Box::new(
            move |graph: &mut Graph,
                  _: &mut Initializer,
                  stream: NodeId|
                  -> GraphResult<DecoderStage> {
                // the stream decides its own batch size
                let stream_shape = graph.shape(stream)?.to_vec();
                let stream_size: usize = stream_shape.iter().product();
                if pixel_size == 0 || stream_size % pixel_size != 0 {
                    return Err(GraphError::InvalidReshape {
                        from: stream_shape,
                        to: input_shape,
                    });
                }
                let mut unflat_shape = input_shape.clone();
                unflat_shape[0] = stream_size / pixel_size;
                let output = graph.reshape(stream, &unflat_shape)?;
                let pretrainer = graph.reshape(flat, &input_shape)?;
                Ok(DecoderStage {
                    output,
                    pretrainer,
                    parameters: None,
                })
            },
        );
        self.push(LayerKind::Flatten, flat, None, build_decoder);
        Ok(self)
    }

    /// Builds the decoder stream from `to_decode` down to the input and the
    /// pretrainer outputs of all layers.
    pub fn finalize(self) -> GraphResult<ConvolutionalAutoencoder> {
        let AutoencoderBuilder {
            graph,
            mut initializer,
            to_encode,
            to_decode,
            pending,
            ..
        } = self;

        let mut stream = to_decode;
        let mut layers = Vec::with_capacity(pending.len());
        for layer in pending.into_iter().rev() {
            let stage = (layer.build_decoder)(&mut *graph, &mut initializer, stream)?;
            stream = stage.output;
            layers.push(LayerRecord {
                kind: layer.kind,
                input: layer.input,
                encoder_output: layer.encoder_output,
                decoder_output: stage.output,
                pretrainer_output: stage.pretrainer,
                encoder: layer.encoder,
                decoder: stage.parameters,
            });
        }
        // built from the top down, index i has to match encoder stage i
        layers.reverse();

        let mut encoder_outputs = vec![to_encode];
        encoder_outputs.extend(layers.iter().map(|l| l.encoder_output));
        Ok(ConvolutionalAutoencoder {
            output_shape: graph.shape(*encoder_outputs.last().unwrap_or(&to_encode))?.to_vec(),
            input: to_encode,
            code_input: to_decode,
            encoder_outputs,
            decoder_outputs: layers.iter().map(|l| l.decoder_output).collect(),
            pretrainer_outputs: layers.iter().map(|l| l.pretrainer_output).collect(),
            layers,
        })
    }
}

/// A finalized autoencoder. Encoder stage `i`, decoder output `i` and
/// pretrainer output `i` all have the same shape; encoder stage 0 is the input.
#[derive(Debug, Clone)]
pub struct ConvolutionalAutoencoder {
    input: NodeId,
    code_input: NodeId,
    output_shape: Shape,
    encoder_outputs: Vec<NodeId>,
    decoder_outputs: Vec<NodeId>,
    pretrainer_outputs: Vec<NodeId>,
    layers: Vec<LayerRecord>,
}

impl ConvolutionalAutoencoder {
    /// Number of encoder stages, the input included.
    pub fn layer_count(&self) -> usize {
        self.encoder_outputs.len()
    }

    /// Shape of the top encoder stage.
    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn code_input(&self) -> NodeId {
        self.code_input
    }

    pub fn encoder_output(&self, layer: usize) -> Option<NodeId> {
        self.encoder_outputs.get(layer).copied()
    }

    pub fn decoder_output(&self, layer: usize) -> Option<NodeId> {
        self.decoder_outputs.get(layer).copied()
    }

    pub fn pretrainer_output(&self, layer: usize) -> Option<NodeId> {
        self.pretrainer_outputs.get(layer).copied()
    }

    pub fn layers(&self) -> &[LayerRecord] {
        &self.layers
    }

    /// Top encoder stage.
    pub fn code(&self) -> NodeId {
        self.encoder_outputs
            .last()
            .copied()
            .unwrap_or(self.input)
    }

    /// Runs `batch` through the encoder stack.
    pub fn encode(&self, graph: &Graph, batch: TensorData) -> GraphResult<TensorData> {
        graph.run_single(self.code(), &Feeds::new().with(self.input, batch))
    }

    /// Full autoencoder pass: encodes `batch` to the top representation and
    /// decodes it again through the decoder stream.
    pub fn reconstruct(&self, graph: &Graph, batch: TensorData) -> GraphResult<TensorData> {
        let code = self.encode(graph, batch)?;
        match self.decoder_output(0) {
            Some(output) => graph.run_single(output, &Feeds::new().with(self.code_input, code)),
            None => Ok(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(
        graph: &mut Graph,
        input_shape: &[usize],
        code_shape: &[usize],
    ) -> GraphResult<ConvolutionalAutoencoder> {
        let images = graph.placeholder("images", input_shape);
        let code = graph.placeholder("code", code_shape);
        let mut builder = AutoencoderBuilder::new(graph, images, code)
            .with_initializer(Initializer::seeded(0.1, 42));
        builder
            .add_conv2d(3, 3, input_shape[3], 4)?
            .add_flatten()?
            .add_fc(code_shape[1])?;
        builder.finalize()
    }

    #[test]
    fn test_stages_line_up() {
        let mut graph = Graph::new();
        let ae = build(&mut graph, &[2, 4, 4, 3], &[2, 5]).unwrap();
        assert_eq!(ae.layer_count(), 4);
        assert_eq!(ae.output_shape(), &[2, 5]);
        assert_eq!(ae.layers().len(), 3);

        for i in 0..ae.layer_count() - 1 {
            let encoder = graph.shape(ae.encoder_output(i).unwrap()).unwrap();
            let decoder = graph.shape(ae.decoder_output(i).unwrap()).unwrap();
            let pretrainer = graph.shape(ae.pretrainer_output(i).unwrap()).unwrap();
            assert_eq!(encoder, decoder, "decoder of layer {}", i);
            assert_eq!(encoder, pretrainer, "pretrainer of layer {}", i);
        }
        assert_eq!(ae.encoder_output(0), Some(ae.input()));
        assert_eq!(ae.encoder_output(3), Some(ae.code()));
        assert!(ae.encoder_output(4).is_none());
        assert!(ae.decoder_output(3).is_none());
        assert!(ae.pretrainer_output(3).is_none());
    }

    #[test]
    fn test_parameters() {
        let mut graph = Graph::new();
        let ae = build(&mut graph, &[2, 4, 4, 3], &[2, 5]).unwrap();

        let names: Vec<_> = graph.variables().map(|(_, n)| n.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "encoder_0.weights",
                "encoder_0.biases",
                "encoder_2.weights",
                "encoder_2.biases",
                "decoder_2.weights",
                "decoder_2.biases",
                "decoder_0.weights",
                "decoder_0.biases",
            ]
        );

        let kinds: Vec<_> = ae.layers().iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![LayerKind::Convolution, LayerKind::Flatten, LayerKind::FullyConnected]
        );
        let flatten = &ae.layers()[1];
        assert!(flatten.encoder.is_none() && flatten.decoder.is_none());

        let conv = &ae.layers()[0];
        let (encoder, decoder) = (conv.encoder.unwrap(), conv.decoder.unwrap());
        assert_ne!(encoder.weights, decoder.weights);
        assert_eq!(
            graph.shape(encoder.weights).unwrap(),
            graph.shape(decoder.weights).unwrap()
        );
        assert_eq!(graph.shape(encoder.biases).unwrap(), &[4]);
        assert_eq!(graph.shape(decoder.biases).unwrap(), &[4, 4, 3]);

        let fc = &ae.layers()[2];
        assert_eq!(graph.shape(fc.encoder.unwrap().weights).unwrap(), &[64, 5]);
        assert_eq!(graph.shape(fc.decoder.unwrap().weights).unwrap(), &[5, 64]);
        assert_eq!(flatten.input, conv.encoder_output);
        assert_eq!(fc.input, flatten.encoder_output);
    }

    #[test]
    fn test_construction_errors() {
        let mut graph = Graph::new();
        let images = graph.placeholder("images", &[2, 4, 4, 3]);
        let code = graph.placeholder("code", &[2, 5]);
        let mut builder = AutoencoderBuilder::new(&mut graph, images, code);
        assert!(matches!(
            builder.add_fc(5),
            Err(GraphError::RankMismatch { op: "add_fc", .. })
        ));
        assert!(matches!(
            builder.add_conv2d(3, 3, 1, 4),
            Err(GraphError::ShapeMismatch { op: "add_conv2d", .. })
        ));
        assert!(matches!(
            builder.add_conv2d(0, 3, 3, 4),
            Err(GraphError::EmptyKernel(0, 3))
        ));
        builder.add_flatten().unwrap();
        assert!(builder.add_flatten().is_err());
        drop(builder);
        // failed calls leave no variables behind
        assert_eq!(graph.variables().count(), 0);

        // the code input does not match the top of the encoder
        let mut graph = Graph::new();
        assert!(build(&mut graph, &[2, 4, 4, 3], &[3, 5]).is_err());
    }

    #[test]
    fn test_flatten_decoder_infers_batch() {
        let mut graph = Graph::new();
        let images = graph.placeholder("images", &[2, 2, 2, 2]);
        let code = graph.placeholder("code", &[4, 4]);
        let mut builder = AutoencoderBuilder::new(&mut graph, images, code);
        builder.add_flatten().unwrap();
        let ae = builder.finalize().unwrap();
        assert_eq!(ae.output_shape(), &[2, 8]);
        assert_eq!(graph.shape(ae.decoder_output(0).unwrap()).unwrap(), &[2, 2, 2, 2]);

        let mut graph = Graph::new();
        let images = graph.placeholder("images", &[2, 2, 2, 2]);
        let code = graph.placeholder("code", &[3, 5]);
        let mut builder = AutoencoderBuilder::new(&mut graph, images, code);
        builder.add_flatten().unwrap();
        assert!(matches!(
            builder.finalize(),
            Err(GraphError::InvalidReshape { .. })
        ));
    }

    #[test]
    fn test_reconstruct() {
        let mut graph = Graph::new();
        let ae = build(&mut graph, &[1, 3, 3, 1], &[1, 2]).unwrap();
        let batch = TensorData::from_elem(ndarray::IxDyn(&[1, 3, 3, 1]), 0.5);

        let code = ae.encode(&graph, batch.clone()).unwrap();
        assert_eq!(code.shape(), &[1, 2]);
        let reconstructed = ae.reconstruct(&graph, batch).unwrap();
        assert_eq!(reconstructed.shape(), &[1, 3, 3, 1]);
        assert!(reconstructed.iter().all(|v| v.is_finite() && *v >= 0.));

        // decoding the code by hand gives the same image
        let decoded = graph
            .run_single(
                ae.decoder_output(0).unwrap(),
                &Feeds::new().with(ae.code_input(), code),
            )
            .unwrap();
        assert_eq!(decoded, reconstructed);
    }
}
