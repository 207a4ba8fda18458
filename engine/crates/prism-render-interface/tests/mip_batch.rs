mod common;

use ash::vk;
use prism_gfx::backend::headless::HeadlessCommand;
use prism_render_interface::mip_generator::{MAX_MIP_REQUESTS_PER_FRAME, MIP_GEN_SHADER};

fn dispatches(commands: &[HeadlessCommand]) -> Vec<glam::UVec3> {
    commands
        .iter()
        .filter_map(|c| match c {
            HeadlessCommand::Dispatch { group_count } => Some(*group_count),
            _ => None,
        })
        .collect()
}

fn create_mip_texture(context: &mut prism_render_interface::render_context::RenderContext, width: u32, height: u32) {
    let pixels = vec![200u8; (width * height * 4) as usize];
    let (_, descriptors, textures, _) = context.managers();
    textures
        .create_texture_from_image(
            descriptors,
            &pixels,
            width,
            height,
            vk::Format::R8G8B8A8_UNORM,
            true,
            false,
            &format!("tex-{}x{}", width, height),
        )
        .unwrap();
}

#[test]
fn test_three_requests_share_one_submission() {
    let shader_dir = tempfile::tempdir().unwrap();
    common::write_minimal_spirv(shader_dir.path(), MIP_GEN_SHADER);
    let (headless, mut context) = common::new_context(shader_dir.path());

    create_mip_texture(&mut context, 256, 256);
    create_mip_texture(&mut context, 100, 60);
    create_mip_texture(&mut context, 64, 32);
    assert_eq!(context.textures().pending_mip_requests(), 3);

    // 256x256 有 9 级 mip，需要两个 pass；其余两张一个 pass
    let dispatch_count = context.flush_uploads().unwrap();
    assert_eq!(dispatch_count, 4);
    assert_eq!(context.textures().pending_mip_requests(), 0);

    let submissions = headless.submissions();
    assert_eq!(submissions.len(), 1);
    let commands = &submissions[0].commands;
    assert_eq!(
        dispatches(commands),
        vec![
            glam::uvec3(8, 8, 1),
            glam::uvec3(1, 1, 1),
            glam::uvec3(4, 2, 1),
            glam::uvec3(2, 1, 1)
        ]
    );

    // pipeline 和 UAV set 只绑定一次
    let bind_count = commands.iter().filter(|c| matches!(c, HeadlessCommand::BindPipeline { .. })).count();
    assert_eq!(bind_count, 1);
    let set_binds = commands
        .iter()
        .filter_map(|c| match c {
            HeadlessCommand::BindDescriptorSets { first_set, .. } => Some(*first_set),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(set_binds, vec![2]);

    // 每个 pass 的参数位于不同的 slice
    let addresses = commands
        .iter()
        .filter_map(|c| match c {
            HeadlessCommand::PushConstants { data, .. } => Some(u64::from_ne_bytes(data[..8].try_into().unwrap())),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(addresses.len(), 4);
    assert!(addresses.windows(2).all(|w| w[0] < w[1]));

    context.destroy();
}

fn mip_constants(headless: &prism_gfx::backend::headless::HeadlessDevice, commands: &[HeadlessCommand]) -> Vec<[u32; 4]> {
    commands
        .iter()
        .filter_map(|c| match c {
            HeadlessCommand::PushConstants { data, .. } => Some(u64::from_ne_bytes(data[..8].try_into().unwrap())),
            _ => None,
        })
        .map(|address| {
            let bytes = headless.read_device_address(address, 16).unwrap();
            let mut words = [0u32; 4];
            for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_ne_bytes(chunk.try_into().unwrap());
            }
            words
        })
        .collect()
}

#[test]
fn test_every_mip_of_256_texture_is_written_once() {
    let shader_dir = tempfile::tempdir().unwrap();
    common::write_minimal_spirv(shader_dir.path(), MIP_GEN_SHADER);
    let (headless, mut context) = common::new_context(shader_dir.path());

    create_mip_texture(&mut context, 256, 256);
    assert_eq!(context.flush_uploads().unwrap(), 2);

    let commands = headless.submitted_commands();
    assert_eq!(dispatches(&commands), vec![glam::uvec3(8, 8, 1), glam::uvec3(1, 1, 1)]);

    // [base_uav_index, mip_count, width, height]
    let constants = mip_constants(&headless, &commands);
    assert_eq!(constants.len(), 2);
    let base = constants[0][0];
    assert_eq!(constants[0], [base, 6, 256, 256]);
    assert_eq!(constants[1], [base + 5, 4, 8, 8]);

    // 每一级 mip 1..9 被恰好一次 dispatch 写入
    let mut written_per_mip = [0u32; 9];
    for [uav, count, _, _] in &constants {
        for mip in uav - base + 1..uav - base + count {
            written_per_mip[mip as usize] += 1;
        }
    }
    assert_eq!(written_per_mip, [0, 1, 1, 1, 1, 1, 1, 1, 1]);

    // 第二个 pass 读取第一个 pass 的输出之前有 barrier
    let first = commands.iter().position(|c| matches!(c, HeadlessCommand::Dispatch { .. })).unwrap();
    let between = &commands[first + 1..];
    let second = between.iter().position(|c| matches!(c, HeadlessCommand::Dispatch { .. })).unwrap();
    assert!(between[..second]
        .iter()
        .any(|c| matches!(c, HeadlessCommand::PipelineBarrier { memory, .. } if !memory.is_empty())));

    context.destroy();
}

#[test]
fn test_requests_over_frame_limit_split_into_batches() {
    let shader_dir = tempfile::tempdir().unwrap();
    common::write_minimal_spirv(shader_dir.path(), MIP_GEN_SHADER);
    let (headless, mut context) = common::new_context(shader_dir.path());

    let request_count = MAX_MIP_REQUESTS_PER_FRAME + 6;
    for _ in 0..request_count {
        create_mip_texture(&mut context, 4, 4);
    }

    let idle_before = headless.queue_idle_count();
    let dispatch_count = context.flush_uploads().unwrap();
    assert_eq!(dispatch_count, request_count);
    assert_eq!(context.textures().pending_mip_requests(), 0);
    assert_eq!(headless.queue_idle_count() - idle_before, 2);

    let per_submission = headless.submissions().iter().map(|s| dispatches(&s.commands).len()).collect::<Vec<_>>();
    assert_eq!(per_submission, vec![MAX_MIP_REQUESTS_PER_FRAME, 6]);

    context.destroy();
}

#[test]
fn test_missing_shader_drops_requests() {
    let shader_dir = tempfile::tempdir().unwrap();
    let (headless, mut context) = common::new_context(shader_dir.path());

    create_mip_texture(&mut context, 32, 32);
    let dispatch_count = context.flush_uploads().unwrap();
    assert_eq!(dispatch_count, 0);
    assert_eq!(context.textures().pending_mip_requests(), 0);
    assert!(dispatches(&headless.submitted_commands()).is_empty());

    context.destroy();
}
