pub mod rand {
    use std::cell::RefCell;

    // Xorshift64 implementation
    pub struct XorShift64 {
        state: u64,
    }

    impl XorShift64 {
        pub fn new(seed: u64) -> Self {
            Self {
                state: if seed == 0 { 88172645463325252 } else { seed },
            }
        }

        pub fn from_entropy() -> Self {
            let mut seed_buf = [0u8; 8];
            let seed = match getrandom::getrandom(&mut seed_buf) {
                Ok(()) => u64::from_le_bytes(seed_buf),
                Err(_) => std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or_default(),
            };
            Self::new(seed)
        }

        pub fn next_u64(&mut self) -> u64 {
            let mut x = self.state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.state = x;
            x
        }

        pub fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        /// Float in [0, 1) with 24 bits of randomness.
        pub fn gen_f32(&mut self) -> f32 {
            let v = self.next_u32() >> 8;
            (v as f32) * (1.0 / 16777216.0)
        }

        pub fn gen_range(&mut self, start: usize, end: usize) -> usize {
            if start >= end {
                return start;
            }
            let range = (end - start) as u64;
            start + (self.next_u64() % range) as usize
        }

        // Fisher-Yates shuffle
        pub fn shuffle<T>(&mut self, slice: &mut [T]) {
            for i in (1..slice.len()).rev() {
                let j = self.gen_range(0, i + 1);
                slice.swap(i, j);
            }
        }
    }

    thread_local! {
        static RNG: RefCell<XorShift64> = RefCell::new(XorShift64::from_entropy());
    }

    /// Reseeds the calling thread's generator so weight initialization,
    /// shuffling and dropout become reproducible.
    pub fn seed(seed: u64) {
        RNG.with(|rng| *rng.borrow_mut() = XorShift64::new(seed));
    }

    // Public API to mimic rand usage
    pub fn rng() -> impl RngCore {
        struct ThreadRngProxy;
        impl RngCore for ThreadRngProxy {
            fn gen_range(&mut self, start: usize, end: usize) -> usize {
                RNG.with(|rng| rng.borrow_mut().gen_range(start, end))
            }
            fn gen_f32(&mut self) -> f32 {
                RNG.with(|rng| rng.borrow_mut().gen_f32())
            }
            fn shuffle<T>(&mut self, slice: &mut [T]) {
                RNG.with(|rng| rng.borrow_mut().shuffle(slice))
            }
        }
        ThreadRngProxy
    }

    pub trait RngCore {
        fn gen_range(&mut self, start: usize, end: usize) -> usize;
        fn gen_f32(&mut self) -> f32;
        fn shuffle<T>(&mut self, slice: &mut [T]);
    }

    pub fn get_random_normal(size: usize, mu: f32, sigma: f32) -> Vec<f32> {
        RNG.with(|rng| {
            let mut r = rng.borrow_mut();
            let mut ans = Vec::with_capacity(size);

            // Box-Muller transform
            while ans.len() < size {
                let u1: f32 = r.gen_f32().max(1e-7);
                let u2: f32 = r.gen_f32();

                let radius = (-2.0 * u1.ln()).sqrt();
                let theta = 2.0 * std::f32::consts::PI * u2;

                ans.push(mu + sigma * radius * theta.cos());
                if ans.len() < size {
                    ans.push(mu + sigma * radius * theta.sin());
                }
            }
            ans
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn seeding_makes_draws_repeatable() {
            seed(42);
            let a = get_random_normal(16, 0.0, 1.0);
            seed(42);
            let b = get_random_normal(16, 0.0, 1.0);
            assert_eq!(a, b);
        }

        #[test]
        fn shuffle_keeps_every_element() {
            let mut v: Vec<usize> = (0..100).collect();
            rng().shuffle(&mut v);
            v.sort_unstable();
            assert_eq!(v, (0..100).collect::<Vec<_>>());
        }
    }
}
