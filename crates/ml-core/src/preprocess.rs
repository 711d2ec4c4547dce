/// How a frame becomes network input: an optional resize, then
/// `(pixel - mean[c]) * scale` on each BGR channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Preprocessing {
    /// Network input `(width, height)`. `None` feeds the frame at its own size.
    pub input_size: Option<(u32, u32)>,
    pub scale: f32,
    /// Per-channel mean in BGR order.
    pub mean: [f32; 3],
}

impl Preprocessing {
    /// MobileNet-SSD blob: 300x300, centred on 127.5 and scaled to about -1..1.
    pub const fn mobilenet_ssd() -> Self {
        Self {
            input_size: Some((300, 300)),
            scale: 0.007843,
            mean: [127.5; 3],
        }
    }

    /// Frame-sized blob with the (104, 177, 123) BGR mean removed and no
    /// scaling, as the Caffe face SSD expects.
    pub const fn full_frame_mean() -> Self {
        Self {
            input_size: None,
            scale: 1.0,
            mean: [104.0, 177.0, 123.0],
        }
    }

    pub fn input_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        self.input_size.unwrap_or((width, height))
    }

    pub fn normalize(&self, bgr: [u8; 3]) -> [f32; 3] {
        let mut out = [0.0; 3];
        for (channel, value) in out.iter_mut().enumerate() {
            *value = (f32::from(bgr[channel]) - self.mean[channel]) * self.scale;
        }
        out
    }
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self::mobilenet_ssd()
    }
}
