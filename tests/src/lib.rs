#[cfg(test)]
mod tests {
    use iced_x86::{Decoder, DecoderOptions};
    use rewriter::{BlockKind, ImportResolver, Phase, RewriteError, Rewriter};

    const TEXT_RVA: u32 = 0x1000;
    const DATA_RVA: u32 = 0x2000;
    const PDATA_RVA: u32 = 0x3000;
    const IDATA_RVA: u32 = 0x4000;

    const IMPORT_LOOKUP_RVA: u32 = IDATA_RVA + 0x30;
    const IMPORT_ADDRESS_RVA: u32 = IDATA_RVA + 0x60;
    const IMPORT_NAME_RVA: u32 = IDATA_RVA + 0x90;
    const IMPORT_HINTS_RVA: u32 = IDATA_RVA + 0xA8;

    fn iat_rva(index: u32) -> u32 {
        IMPORT_ADDRESS_RVA + index * 8
    }

    fn w16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn w32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn w64(image: &mut [u8], offset: usize, value: u64) {
        image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Builds a minimal PE32+ image: `.text` at 0x1000, `.data` at 0x2000,
    /// `.pdata` at 0x3000 and, when imports are requested, `.idata` at
    /// 0x4000. Raw section data is 0x200 bytes each, file-aligned to
    /// 0x200, sections virtual-aligned to 0x1000.
    struct TestImage {
        code: Vec<u8>,
        data: Vec<u8>,
        functions: Vec<(u32, u32)>,
        import: Option<(&'static str, Vec<&'static str>)>,
    }

    impl TestImage {
        fn new(code: Vec<u8>) -> Self {
            Self {
                code,
                data: Vec::new(),
                functions: Vec::new(),
                import: None,
            }
        }

        fn data(mut self, data: Vec<u8>) -> Self {
            self.data = data;
            self
        }

        fn function(mut self, begin: u32, end: u32) -> Self {
            self.functions.push((begin, end));
            self
        }

        fn import(mut self, module: &'static str, symbols: Vec<&'static str>) -> Self {
            self.import = Some((module, symbols));
            self
        }

        fn build(self) -> Vec<u8> {
            assert!(self.code.len() <= 0x200);
            assert!(self.data.len() <= 0x200);

            let section_count: u16 = if self.import.is_some() { 4 } else { 3 };
            let file_size = 0xA00 + if self.import.is_some() { 0x200 } else { 0 };
            let mut image = vec![0u8; file_size];

            // DOS header
            w16(&mut image, 0x00, 0x5A4D);
            w32(&mut image, 0x3C, 0x80);
            // PE signature + file header
            w32(&mut image, 0x80, 0x0000_4550);
            w16(&mut image, 0x84, 0x8664);
            w16(&mut image, 0x86, section_count);
            w16(&mut image, 0x94, 0xF0);
            w16(&mut image, 0x96, 0x0022);

            // optional header (PE32+)
            let opt = 0x98;
            w16(&mut image, opt, 0x20B);
            w32(&mut image, opt + 0x10, TEXT_RVA);
            w32(&mut image, opt + 0x14, TEXT_RVA);
            w64(&mut image, opt + 0x18, 0x0001_4000_0000);
            w32(&mut image, opt + 0x20, 0x1000);
            w32(&mut image, opt + 0x24, 0x200);
            w16(&mut image, opt + 0x44, 3);
            w32(&mut image, opt + 0x38, 0x1000 + section_count as u32 * 0x1000);
            w32(&mut image, opt + 0x3C, 0x400);
            w32(&mut image, opt + 0x6C, 16);

            // data directories: import is index 1, exception is index 3
            let directories = opt + 0x70;
            if self.import.is_some() {
                w32(&mut image, directories + 8, IDATA_RVA);
                w32(&mut image, directories + 12, 40);
            }
            if !self.functions.is_empty() {
                w32(&mut image, directories + 24, PDATA_RVA);
                w32(&mut image, directories + 28, self.functions.len() as u32 * 12);
            }

            // section table
            let mut section = |index: usize, name: &[u8], rva: u32, raw: u32, flags: u32| {
                let offset = 0x188 + index * 40;
                image[offset..offset + name.len()].copy_from_slice(name);
                w32(&mut image, offset + 8, 0x1000);
                w32(&mut image, offset + 12, rva);
                w32(&mut image, offset + 16, 0x200);
                w32(&mut image, offset + 20, raw);
                w32(&mut image, offset + 36, flags);
            };
            section(0, b".text", TEXT_RVA, 0x400, 0x6000_0020);
            section(1, b".data", DATA_RVA, 0x600, 0xC000_0040);
            section(2, b".pdata", PDATA_RVA, 0x800, 0x4000_0040);
            if self.import.is_some() {
                section(3, b".idata", IDATA_RVA, 0xA00, 0xC000_0040);
            }

            image[0x400..0x400 + self.code.len()].copy_from_slice(&self.code);
            image[0x600..0x600 + self.data.len()].copy_from_slice(&self.data);

            for (index, (begin, end)) in self.functions.iter().enumerate() {
                let offset = 0x800 + index * 12;
                w32(&mut image, offset, *begin);
                w32(&mut image, offset + 4, *end);
            }

            if let Some((module, symbols)) = &self.import {
                assert!(symbols.len() <= 4);

                // descriptor + null terminator
                w32(&mut image, 0xA00, IMPORT_LOOKUP_RVA);
                w32(&mut image, 0xA00 + 12, IMPORT_NAME_RVA);
                w32(&mut image, 0xA00 + 16, IMPORT_ADDRESS_RVA);

                let name_offset = 0xA00 + (IMPORT_NAME_RVA - IDATA_RVA) as usize;
                image[name_offset..name_offset + module.len()].copy_from_slice(module.as_bytes());

                let mut hint_rva = IMPORT_HINTS_RVA;
                for (index, symbol) in symbols.iter().enumerate() {
                    let lookup = 0xA00 + (IMPORT_LOOKUP_RVA - IDATA_RVA) as usize + index * 8;
                    let address = 0xA00 + (IMPORT_ADDRESS_RVA - IDATA_RVA) as usize + index * 8;
                    w64(&mut image, lookup, hint_rva as u64);
                    w64(&mut image, address, hint_rva as u64);

                    let hint = 0xA00 + (hint_rva - IDATA_RVA) as usize;
                    image[hint + 2..hint + 2 + symbol.len()].copy_from_slice(symbol.as_bytes());
                    hint_rva += 2 + symbol.len() as u32 + 1;
                }
            }

            image
        }
    }

    struct NullResolver;

    impl ImportResolver for NullResolver {
        fn load_module(&mut self, _name: &str) -> Option<u64> {
            None
        }

        fn resolve_symbol(&mut self, _module: u64, _name: &str) -> Option<u64> {
            None
        }

        fn resolve_ordinal(&mut self, _module: u64, _ordinal: u16) -> Option<u64> {
            None
        }
    }

    struct MockResolver {
        module: u64,
        address: u64,
        loaded: Vec<String>,
        resolved: Vec<String>,
    }

    impl MockResolver {
        fn new() -> Self {
            Self {
                module: 0x4000_0000,
                address: 0xDEAD_BEEF_0BAD_F00D,
                loaded: Vec::new(),
                resolved: Vec::new(),
            }
        }
    }

    impl ImportResolver for MockResolver {
        fn load_module(&mut self, name: &str) -> Option<u64> {
            self.loaded.push(name.to_string());
            Some(self.module)
        }

        fn resolve_symbol(&mut self, module: u64, name: &str) -> Option<u64> {
            assert_eq!(module, self.module);
            self.resolved.push(name.to_string());
            Some(self.address)
        }

        fn resolve_ordinal(&mut self, _module: u64, _ordinal: u16) -> Option<u64> {
            None
        }
    }

    struct Regions {
        code: Vec<u8>,
        data: Vec<u8>,
    }

    impl Regions {
        fn new(code_size: usize, data_size: usize) -> Self {
            Self {
                code: vec![0u8; code_size],
                data: vec![0xAAu8; data_size],
            }
        }

        fn attach(&mut self, session: &mut Rewriter) {
            session.add_code_region(self.code.as_mut_ptr(), self.code.len());
            session.add_data_region(self.data.as_mut_ptr(), self.data.len());
        }

        fn code_base(&self) -> u64 {
            self.code.as_ptr() as u64
        }

        fn data_offset_of(&self, address: u64) -> usize {
            (address - self.data.as_ptr() as u64) as usize
        }
    }

    fn check_block_invariants(session: &Rewriter) {
        let blocks = session.code_blocks();
        for pair in blocks.windows(2) {
            assert!(pair[0].rva + pair[0].size as u32 <= pair[1].rva);
        }
        for block in blocks {
            if block.final_address.is_some() {
                assert!(block.final_size <= block.expected_size);
            }
        }
    }

    #[test]
    fn trivial_return_function() {
        let image = TestImage::new(vec![0xC3])
            .function(TEXT_RVA, TEXT_RVA + 1)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        assert_eq!(session.code_blocks().len(), 1);
        assert_eq!(session.code_blocks()[0].kind, BlockKind::NonRelative);
        assert_eq!(session.code_blocks()[0].size, 1);

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        assert_eq!(session.entry_point(), Some(regions.code_base()));
        assert_eq!(regions.code[0], 0xC3);
        check_block_invariants(&session);
    }

    #[test]
    fn short_jump_stays_short_and_patches_forward() {
        // jmp +0x10 over padding, ret at the target
        let mut code = vec![0x90u8; 0x13];
        code[0] = 0xEB;
        code[1] = 0x10;
        code[0x12] = 0xC3;

        let image = TestImage::new(code)
            .function(TEXT_RVA, TEXT_RVA + 2)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let kinds: Vec<BlockKind> = session.code_blocks().iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BlockKind::Relative, BlockKind::NonRelative]);

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        // the padding between the blocks is gone, so the jump lands on the
        // next instruction
        assert_eq!(regions.code[0], 0xEB);
        assert_eq!(regions.code[1], 0x00);
        assert_eq!(regions.code[2], 0xC3);
        check_block_invariants(&session);
    }

    #[test]
    fn rip_relative_load_follows_data() {
        // mov rax, [rip+0x1039] -> rva 0x2040; ret
        let code = vec![0x48, 0x8B, 0x05, 0x39, 0x10, 0x00, 0x00, 0xC3];
        let marker = 0x1122_3344_5566_7788u64;
        let mut data = vec![0u8; 0x80];
        data[0x40..0x48].copy_from_slice(&marker.to_le_bytes());

        let image = TestImage::new(code)
            .data(data)
            .function(TEXT_RVA, TEXT_RVA + 8)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        let target_final = session.rva_to_final_address(DATA_RVA + 0x40).unwrap();

        // decode the rewritten instruction and check it references the
        // data block's final home
        let mut decoder = Decoder::with_ip(
            64,
            &regions.code[..7],
            regions.code_base(),
            DecoderOptions::NONE,
        );
        let instruction = decoder.decode();
        assert!(instruction.is_ip_rel_memory_operand());
        assert_eq!(instruction.ip_rel_memory_address(), target_final);

        // and the marker made the trip
        let offset = regions.data_offset_of(target_final);
        assert_eq!(
            &regions.data[offset..offset + 8],
            &marker.to_le_bytes()
        );
        check_block_invariants(&session);
    }

    #[test]
    fn forward_call_is_patched_when_target_lands() {
        // call 0x1100; ret -- second function is just a ret
        let mut code = vec![0x90u8; 0x101];
        code[0] = 0xE8;
        code[1..5].copy_from_slice(&0xFBu32.to_le_bytes());
        code[5] = 0xC3;
        code[0x100] = 0xC3;

        let image = TestImage::new(code)
            .function(TEXT_RVA, TEXT_RVA + 6)
            .function(TEXT_RVA + 0x100, TEXT_RVA + 0x101)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        // layout: call(5) ret(1) ret(1); the call displacement must skip
        // exactly the first ret
        assert_eq!(regions.code[0], 0xE8);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&regions.code[1..5]);
        assert_eq!(i32::from_le_bytes(raw), 1);
        assert_eq!(regions.code[5], 0xC3);
        assert_eq!(regions.code[6], 0xC3);
        check_block_invariants(&session);
    }

    #[test]
    fn fall_through_chains_across_regions() {
        // two functions, the second forced into the second region
        let mut code = vec![0x90u8; 6];
        code[4] = 0xC3;
        code[5] = 0xC3;

        let image = TestImage::new(code)
            .function(TEXT_RVA, TEXT_RVA + 5)
            .function(TEXT_RVA + 5, TEXT_RVA + 6)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut first = vec![0u8; 10];
        let mut second = vec![0u8; 8];
        let mut data = vec![0u8; 0x4000];
        session.add_code_region(first.as_mut_ptr(), first.len());
        session.add_code_region(second.as_mut_ptr(), second.len());
        session.add_data_region(data.as_mut_ptr(), data.len());
        session.write(&mut NullResolver).unwrap();

        assert_eq!(&first[..5], &[0x90, 0x90, 0x90, 0x90, 0xC3]);

        // the region closes with a jump into the next one
        assert_eq!(first[5], 0xE9);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&first[6..10]);
        let displacement = i32::from_le_bytes(raw) as i64;
        let jump_end = first.as_ptr() as u64 + 10;
        assert_eq!((jump_end as i64 + displacement) as u64, second.as_ptr() as u64);

        assert_eq!(second[0], 0xC3);
        assert_eq!(
            session.rva_to_final_address(TEXT_RVA + 5),
            Some(second.as_ptr() as u64)
        );
        check_block_invariants(&session);
    }

    #[test]
    fn import_slot_receives_resolved_address() {
        let image = TestImage::new(vec![0xC3])
            .function(TEXT_RVA, TEXT_RVA + 1)
            .import("KERNEL32.dll", vec!["ExitProcess"])
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x100, 0x8000);
        regions.attach(&mut session);

        let mut resolver = MockResolver::new();
        session.write(&mut resolver).unwrap();

        assert_eq!(resolver.loaded, vec!["KERNEL32.dll"]);
        assert_eq!(resolver.resolved, vec!["ExitProcess"]);

        let slot = session.rva_to_final_address(iat_rva(0)).unwrap();
        let offset = regions.data_offset_of(slot);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&regions.data[offset..offset + 8]);
        assert_eq!(u64::from_le_bytes(raw), 0xDEAD_BEEF_0BAD_F00D);
    }

    #[test]
    fn unresolved_import_aborts() {
        let image = TestImage::new(vec![0xC3])
            .function(TEXT_RVA, TEXT_RVA + 1)
            .import("KERNEL32.dll", vec!["ExitProcess"])
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x100, 0x8000);
        regions.attach(&mut session);

        let error = session.write(&mut NullResolver).unwrap_err();
        assert_eq!(error.phase(), Phase::Imports);
        assert!(matches!(error, RewriteError::ImportResolution { .. }));
    }

    #[test]
    fn second_write_fails_cleanly() {
        let image = TestImage::new(vec![0xC3])
            .function(TEXT_RVA, TEXT_RVA + 1)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        let error = session.write(&mut NullResolver).unwrap_err();
        assert!(matches!(error, RewriteError::AlreadyWritten));
    }

    #[test]
    fn empty_function_entry_emits_nothing() {
        let image = TestImage::new(vec![0xC3])
            .function(TEXT_RVA, TEXT_RVA)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        assert!(session.code_blocks().is_empty());

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        // data still lands, but nothing covers the entry point
        assert_eq!(session.entry_point(), None);
    }

    #[test]
    fn backward_jump_into_relative_interior_fails() {
        // mov rax, [rip+0x1039]; jmp back into the middle of the mov
        let code = vec![0x48, 0x8B, 0x05, 0x39, 0x10, 0x00, 0x00, 0xEB, 0xF9];

        let image = TestImage::new(code)
            .function(TEXT_RVA, TEXT_RVA + 9)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);

        let error = session.write(&mut NullResolver).unwrap_err();
        assert!(matches!(
            error,
            RewriteError::UnresolvableTarget { target, .. } if target == TEXT_RVA + 2
        ));
    }

    #[test]
    fn pessimistic_forward_jump_promotes_without_contraction() {
        // jmp over four RIP-relative loads; the worst-case distance needs
        // rel32 even though the real one would fit rel8
        let mut code = Vec::new();
        code.extend_from_slice(&[0xEB, 0x1C]);
        for index in 0..4u32 {
            let rva = TEXT_RVA + 2 + index * 7;
            let displacement = DATA_RVA as i32 - (rva as i32 + 7);
            code.extend_from_slice(&[0x48, 0x8B, 0x05]);
            code.extend_from_slice(&displacement.to_le_bytes());
        }
        code.push(0xC3);

        let image = TestImage::new(code)
            .function(TEXT_RVA, TEXT_RVA + 2)
            .function(TEXT_RVA + 2, TEXT_RVA + 0x1F)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x200, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        // near form, patched to land on the ret behind the loads
        assert_eq!(regions.code[0], 0xE9);
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&regions.code[1..5]);
        assert_eq!(i32::from_le_bytes(raw), 4 * 7);
        assert_eq!(regions.code[5 + 4 * 7], 0xC3);

        // every load still points at the data block
        let data_final = session.rva_to_final_address(DATA_RVA).unwrap();
        for index in 0..4u64 {
            let start = 5 + index as usize * 7;
            let mut decoder = Decoder::with_ip(
                64,
                &regions.code[start..start + 7],
                regions.code_base() + start as u64,
                DecoderOptions::NONE,
            );
            let instruction = decoder.decode();
            assert_eq!(instruction.ip_rel_memory_address(), data_final);
        }
        check_block_invariants(&session);
    }

    #[test]
    fn non_relative_bytes_round_trip() {
        // push rbp; mov rbp, rsp; pop rbp; ret
        let source = vec![0x55, 0x48, 0x89, 0xE5, 0x5D, 0xC3];
        let image = TestImage::new(source.clone())
            .function(TEXT_RVA, TEXT_RVA + 6)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        assert_eq!(session.code_blocks().len(), 1);

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        assert_eq!(&regions.code[..6], source.as_slice());
    }

    #[test]
    fn data_blocks_copy_then_zero_fill() {
        let mut content = vec![0u8; 0x200];
        for (index, byte) in content.iter_mut().enumerate() {
            *byte = index as u8;
        }

        let image = TestImage::new(vec![0xC3])
            .function(TEXT_RVA, TEXT_RVA + 1)
            .data(content.clone())
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut regions = Regions::new(0x100, 0x4000);
        regions.attach(&mut session);
        session.write(&mut NullResolver).unwrap();

        let base = session.rva_to_final_address(DATA_RVA).unwrap();
        let offset = regions.data_offset_of(base);
        assert_eq!(base % 16, 0);
        assert_eq!(&regions.data[offset..offset + 0x200], content.as_slice());
        // the rest of the virtual size was cleared over the 0xAA fill
        assert!(regions.data[offset + 0x200..offset + 0x1000]
            .iter()
            .all(|&byte| byte == 0));
    }

    #[test]
    fn blocks_stay_sorted_across_seed_order() {
        let mut code = vec![0x90u8; 0x42];
        code[0] = 0xC3;
        code[0x20] = 0xC3;
        code[0x41] = 0xC3;

        let image = TestImage::new(code)
            .function(TEXT_RVA + 0x21, TEXT_RVA + 0x42)
            .function(TEXT_RVA, TEXT_RVA + 1)
            .function(TEXT_RVA + 1, TEXT_RVA + 0x21)
            .build();
        let session = Rewriter::from_bytes(&image).unwrap();

        let rvas: Vec<u32> = session.code_blocks().iter().map(|b| b.rva).collect();
        assert_eq!(rvas, vec![TEXT_RVA, TEXT_RVA + 1, TEXT_RVA + 0x21]);
        check_block_invariants(&session);
    }

    #[test]
    fn capacity_exhaustion_is_layout_phase() {
        let image = TestImage::new(vec![0x90, 0x90, 0x90, 0x90, 0xC3])
            .function(TEXT_RVA, TEXT_RVA + 5)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let mut code = vec![0u8; 3];
        let mut data = vec![0u8; 0x4000];
        session.add_code_region(code.as_mut_ptr(), code.len());
        session.add_data_region(data.as_mut_ptr(), data.len());

        let error = session.write(&mut NullResolver).unwrap_err();
        assert_eq!(error.phase(), Phase::Layout);
        assert!(matches!(error, RewriteError::CapacityExhausted { .. }));
    }

    #[test]
    fn rva_translation_follows_sections() {
        let image = TestImage::new(vec![0xC3])
            .function(TEXT_RVA, TEXT_RVA + 1)
            .build();
        let session = Rewriter::from_bytes(&image).unwrap();

        let image = session.image();
        assert_eq!(image.rva_to_offset(TEXT_RVA), Some(0x400));
        assert_eq!(image.rva_to_offset(DATA_RVA + 0x10), Some(0x610));
        assert_eq!(image.rva_to_offset(0x9000), None);
    }

    #[test]
    fn capacity_hints_are_sufficient() {
        let mut code = vec![0x90u8; 0x13];
        code[0] = 0xEB;
        code[1] = 0x10;
        code[0x12] = 0xC3;

        let image = TestImage::new(code)
            .function(TEXT_RVA, TEXT_RVA + 2)
            .build();
        let mut session = Rewriter::from_bytes(&image).unwrap();

        let code_size = session.code_capacity_hint();
        let data_size = session.data_capacity_hint();
        let mut code = vec![0u8; code_size];
        let mut data = vec![0u8; data_size];
        session.add_code_region(code.as_mut_ptr(), code.len());
        session.add_data_region(data.as_mut_ptr(), data.len());

        session.write(&mut NullResolver).unwrap();
        assert!(session.entry_point().is_some());
    }
}
